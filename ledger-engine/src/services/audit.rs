//! Audit sink collaborator.
//!
//! The ledger records every mutation through an [`AuditSink`]. Recording is
//! fire-and-forget: a sink failure is logged and never aborts the money
//! movement it describes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Request-scoped actor context attached to audit records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditContext {
    pub user_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One audited mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub tenant_id: Uuid,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub user_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Uuid,
        tenant_id: Uuid,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        ctx: &AuditContext,
    ) -> Self {
        Self {
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id,
            tenant_id,
            before,
            after,
            user_id: ctx.user_id,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            created_utc: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), anyhow::Error>;
}

/// Record an audit event, logging instead of failing when the sink errors.
pub async fn record_or_log(sink: &dyn AuditSink, record: AuditRecord) {
    let action = record.action.clone();
    let entity_id = record.entity_id;
    if let Err(e) = sink.record(record).await {
        warn!(action = %action, entity_id = %entity_id, error = %e, "Audit sink failed");
    }
}

/// Sink that emits audit records as structured log events.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), anyhow::Error> {
        info!(
            action = %record.action,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            tenant_id = %record.tenant_id,
            user_id = ?record.user_id,
            "audit"
        );
        Ok(())
    }
}
