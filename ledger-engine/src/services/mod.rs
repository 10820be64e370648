//! Ledger services.

pub mod audit;
pub mod gateway;
pub mod invoice_ledger;
pub mod metrics;
pub mod payment_ledger;
pub mod sequencer;

pub use audit::{AuditContext, AuditRecord, AuditSink, TracingAuditSink};
pub use gateway::{ChargeIntent, ChargeRequest, GatewayRefund, MockGateway, PaymentGateway, StripeClient};
pub use invoice_ledger::InvoiceLedger;
pub use payment_ledger::PaymentLedger;
