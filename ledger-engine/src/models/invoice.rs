//! Invoice model.

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use ledger_core::error::LedgerError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::LineItemInput;

/// Invoice status.
///
/// `draft -> sent -> viewed -> {partially_paid -> paid} | cancelled`.
/// Paid invoices cannot be cancelled; cancelled invoices cannot receive
/// payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Viewed,
    PartiallyPaid,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Viewed => "viewed",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sent" => InvoiceStatus::Sent,
            "viewed" => InvoiceStatus::Viewed,
            "partially_paid" => InvoiceStatus::PartiallyPaid,
            "paid" => InvoiceStatus::Paid,
            "cancelled" => InvoiceStatus::Cancelled,
            _ => InvoiceStatus::Draft,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Invoice row.
///
/// `balance = total - amount_paid` at all times; `amount_paid` only moves
/// through validated payment application and refund release. `row_version`
/// guards every balance-bearing write (compare-and-swap).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub quote_id: Option<Uuid>,
    pub invoice_number: String,
    pub status: String,
    pub currency: String,
    pub exchange_rate: Decimal,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
    pub deposit_required: Decimal,
    pub amount_paid: Decimal,
    pub balance: Decimal,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub row_version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub sent_utc: Option<DateTime<Utc>>,
    pub viewed_utc: Option<DateTime<Utc>>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Get parsed invoice status.
    pub fn parsed_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    /// Check if invoice is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_utc.is_some()
    }

    /// Apply a validated payment amount, returning the updated row.
    ///
    /// The caller commits the result under a row-version guard; validation
    /// here runs against the state that was read inside the same guarded
    /// attempt, so two concurrent payments can never combine past `total`.
    pub fn with_payment_applied(
        &self,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Invoice, LedgerError> {
        if self.parsed_status() == InvoiceStatus::Cancelled {
            return Err(LedgerError::InvalidState(anyhow!(
                "cannot apply payment to cancelled invoice {}",
                self.invoice_id
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(anyhow!(
                "payment amount must be positive, got {}",
                amount
            )));
        }
        let new_paid = self.amount_paid + amount;
        if new_paid > self.total {
            return Err(LedgerError::OverpaymentRejected(anyhow!(
                "payment of {} would bring amount paid to {}, exceeding total {}",
                amount,
                new_paid,
                self.total
            )));
        }

        let mut updated = self.clone();
        updated.amount_paid = new_paid;
        updated.balance = updated.total - updated.amount_paid;
        updated.status = if updated.balance == Decimal::ZERO {
            InvoiceStatus::Paid.as_str().to_string()
        } else {
            InvoiceStatus::PartiallyPaid.as_str().to_string()
        };
        updated.row_version += 1;
        updated.updated_utc = now;
        Ok(updated)
    }

    /// Release a refunded amount, the inverse of payment application.
    pub fn with_payment_released(
        &self,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Invoice, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(anyhow!(
                "refund amount must be positive, got {}",
                amount
            )));
        }
        if amount > self.amount_paid {
            return Err(LedgerError::InvalidInput(anyhow!(
                "refund of {} exceeds amount paid {} on invoice {}",
                amount,
                self.amount_paid,
                self.invoice_id
            )));
        }

        let mut updated = self.clone();
        updated.amount_paid -= amount;
        updated.balance = updated.total - updated.amount_paid;
        updated.status = if updated.amount_paid > Decimal::ZERO {
            InvoiceStatus::PartiallyPaid.as_str().to_string()
        } else if updated.viewed_utc.is_some() {
            InvoiceStatus::Viewed.as_str().to_string()
        } else if updated.sent_utc.is_some() {
            InvoiceStatus::Sent.as_str().to_string()
        } else {
            InvoiceStatus::Draft.as_str().to_string()
        };
        updated.row_version += 1;
        updated.updated_utc = now;
        Ok(updated)
    }
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub customer_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

/// Input for creating an invoice.
///
/// `line_items` may be empty when `quote_id` is given; the quote's items are
/// copied in that case.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub quote_id: Option<Uuid>,
    pub line_items: Vec<LineItemInput>,
    pub currency: String,
    pub exchange_rate: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub deposit_required: Option<Decimal>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Input for updating an invoice (draft only).
#[derive(Debug, Clone, Default)]
pub struct UpdateInvoice {
    pub line_items: Option<Vec<LineItemInput>>,
    pub due_date: Option<NaiveDate>,
    pub deposit_required: Option<Decimal>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
