//! Payment model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment status.
///
/// `pending -> {completed | failed}`; a completed payment becomes
/// `refunded` once cumulative refunds exhaust the refundable ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => PaymentStatus::Completed,
            "failed" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    BankTransfer,
    Card,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Check => "check",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Card => "card",
            PaymentMethod::Other => "other",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "cash" => PaymentMethod::Cash,
            "check" => PaymentMethod::Check,
            "bank_transfer" => PaymentMethod::BankTransfer,
            "card" => PaymentMethod::Card,
            _ => PaymentMethod::Other,
        }
    }
}

/// Payment row.
///
/// For gateway payments `net_amount = amount - processor_fee`; the
/// refundable ceiling is the net amount, never the gross. The invoice is
/// credited with the gross amount on completion (the fee is the merchant's
/// cost, not a discount to the customer), so `amount_paid` on the invoice
/// and `net_amount` here intentionally diverge.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub payment_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub status: String,
    pub processor_fee: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    pub refunded_total: Decimal,
    pub gateway_intent_id: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub row_version: i64,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub failed_utc: Option<DateTime<Utc>>,
    pub refunded_utc: Option<DateTime<Utc>>,
}

impl Payment {
    /// Get parsed payment status.
    pub fn parsed_status(&self) -> PaymentStatus {
        PaymentStatus::from_string(&self.status)
    }

    /// Remaining refundable amount: net received minus prior refunds.
    ///
    /// Falls back to the gross amount when no net was recorded
    /// (non-gateway rows predating fee tracking).
    pub fn refundable_remaining(&self) -> Decimal {
        self.net_amount.unwrap_or(self.amount) - self.refunded_total
    }
}

/// Filter parameters for listing payments.
#[derive(Debug, Clone, Default)]
pub struct ListPaymentsFilter {
    pub status: Option<PaymentStatus>,
    pub customer_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

/// Input for recording a manually settled payment.
#[derive(Debug, Clone)]
pub struct CreateManualPayment {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub metadata: Option<serde_json::Value>,
}

/// Input for initiating a gateway payment against an invoice.
#[derive(Debug, Clone)]
pub struct CreateGatewayPayment {
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub metadata: Option<serde_json::Value>,
}
