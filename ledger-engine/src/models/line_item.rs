//! Line item model with append-only versioning.
//!
//! Line items are never destructively updated. An edit marks every current
//! row superseded (`is_latest_version = false`, `superseded_utc`, forward
//! `superseded_by` link) and inserts replacement rows with an incremented
//! `version`. Only latest rows participate in totals and default queries;
//! superseded rows are history and are never deleted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::calculator::LineAmounts;

/// Line item row on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_percent: Decimal,
    pub tax_rate: Decimal,
    pub discount_amount: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub version: i32,
    pub is_latest_version: bool,
    pub superseded_utc: Option<DateTime<Utc>>,
    pub superseded_by: Option<Uuid>,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

impl LineItem {
    /// Build a fresh latest-version row from validated input and its
    /// computed amounts.
    pub fn from_input(
        tenant_id: Uuid,
        invoice_id: Uuid,
        input: &LineItemInput,
        amounts: &LineAmounts,
        version: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            line_item_id: Uuid::new_v4(),
            invoice_id,
            tenant_id,
            description: input.description.clone(),
            quantity: input.quantity,
            unit_price: input.unit_price,
            discount_percent: input.discount_percent,
            tax_rate: input.tax_rate,
            discount_amount: amounts.discount_amount,
            subtotal: amounts.subtotal,
            tax_amount: amounts.tax_amount,
            total: amounts.total,
            version,
            is_latest_version: true,
            superseded_utc: None,
            superseded_by: None,
            sort_order: input.sort_order,
            created_utc: now,
        }
    }

    /// Copy of this row marked superseded by `successor`.
    pub fn superseded(&self, successor: Option<Uuid>, now: DateTime<Utc>) -> Self {
        let mut row = self.clone();
        row.is_latest_version = false;
        row.superseded_utc = Some(now);
        row.superseded_by = successor;
        row
    }
}

/// Input for one line item.
#[derive(Debug, Clone)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_percent: Decimal,
    pub tax_rate: Decimal,
    pub sort_order: i32,
}
