//! Refund model.
//!
//! Refunds are first-class rows rather than metadata on the payment, so
//! they are queryable and their writes never race on a JSON column.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Refund row against a completed payment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Refund {
    pub refund_id: Uuid,
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub created_utc: DateTime<Utc>,
}
