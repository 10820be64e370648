//! Customer reference model.
//!
//! Customer administration lives elsewhere; the ledger only checks that a
//! referenced customer exists within the calling tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Customer row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub customer_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub created_utc: DateTime<Utc>,
}
