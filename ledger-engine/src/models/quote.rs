//! Quote reference model.
//!
//! Quotes are managed elsewhere; the ledger only reads them when converting
//! an accepted quote into an invoice. At most one invoice may originate
//! from a quote.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Quote status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Accepted,
    Declined,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Draft => "draft",
            QuoteStatus::Sent => "sent",
            QuoteStatus::Accepted => "accepted",
            QuoteStatus::Declined => "declined",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sent" => QuoteStatus::Sent,
            "accepted" => QuoteStatus::Accepted,
            "declined" => QuoteStatus::Declined,
            _ => QuoteStatus::Draft,
        }
    }
}

/// Quote row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Quote {
    pub quote_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub status: String,
    pub currency: String,
    pub created_utc: DateTime<Utc>,
}

impl Quote {
    pub fn parsed_status(&self) -> QuoteStatus {
        QuoteStatus::from_string(&self.status)
    }
}

/// Line on a quote, copied into the invoice at conversion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuoteItem {
    pub quote_item_id: Uuid,
    pub quote_id: Uuid,
    pub tenant_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_percent: Decimal,
    pub tax_rate: Decimal,
    pub sort_order: i32,
}
