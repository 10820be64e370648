//! Storage abstraction for the ledger.
//!
//! Services receive an `Arc<dyn LedgerStore>` handle per construction; no
//! module-level client exists. Balance-bearing rows (invoices, payments)
//! carry a `row_version` column and every write against them is guarded:
//! the store compares the caller's expected version and reports
//! [`UpdateOutcome::Conflict`] instead of clobbering a concurrent writer.
//! Writes that must land together (payment completion plus invoice balance,
//! refund plus payment plus invoice) are single trait calls so each backend
//! can make them atomic.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use ledger_core::error::LedgerError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Customer, Invoice, LineItem, ListInvoicesFilter, ListPaymentsFilter, Payment, Quote,
    QuoteItem, Refund,
};

pub use memory::MemStore;
pub use postgres::PgStore;

/// Storage-level failures, mapped onto the ledger taxonomy at the service
/// layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint fired; the label names the constraint
    /// (`invoice_number`, `payment_number`, `quote_invoice`).
    #[error("duplicate {0}")]
    Duplicate(&'static str),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(label) => {
                LedgerError::Conflict(anyhow::anyhow!("duplicate {}", label))
            }
            StoreError::Backend(e) => LedgerError::DatabaseError(e),
        }
    }
}

/// Result of a guarded (compare-and-swap) write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The row's version moved since the caller read it; re-read and retry.
    Conflict,
}

/// A guarded invoice write piggybacking on another row's commit.
pub struct InvoiceUpdate<'a> {
    pub invoice: &'a Invoice,
    pub expected_version: i64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---------------------------------------------------------------------
    // Reference data
    // ---------------------------------------------------------------------

    async fn insert_customer(&self, customer: &Customer) -> Result<(), StoreError>;

    async fn customer_exists(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<bool, StoreError>;

    async fn insert_quote(&self, quote: &Quote, items: &[QuoteItem]) -> Result<(), StoreError>;

    async fn get_quote(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Option<Quote>, StoreError>;

    async fn quote_items(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Vec<QuoteItem>, StoreError>;

    /// Whether an invoice already originates from this quote.
    async fn quote_converted(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<bool, StoreError>;

    // ---------------------------------------------------------------------
    // Invoices
    // ---------------------------------------------------------------------

    /// Persist a new invoice and its line items atomically.
    ///
    /// A taken invoice number surfaces as `Duplicate("invoice_number")` so
    /// the sequencer loop can retry; a taken quote link surfaces as
    /// `Duplicate("quote_invoice")`.
    async fn insert_invoice(
        &self,
        invoice: &Invoice,
        items: &[LineItem],
    ) -> Result<(), StoreError>;

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, StoreError>;

    async fn list_invoices(
        &self,
        tenant_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, StoreError>;

    /// Invoice number of the most recently created invoice for the tenant,
    /// ordered by creation time (never by parsing the number field).
    async fn latest_invoice_number(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<String>, StoreError>;

    /// Guarded invoice write, optionally re-versioning line items in the
    /// same atomic step: `superseded` rows are rewritten in place, `inserted`
    /// rows are appended. Superseded rows are never deleted.
    async fn update_invoice(
        &self,
        invoice: &Invoice,
        expected_version: i64,
        superseded: &[LineItem],
        inserted: &[LineItem],
    ) -> Result<UpdateOutcome, StoreError>;

    async fn line_items(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        latest_only: bool,
    ) -> Result<Vec<LineItem>, StoreError>;

    // ---------------------------------------------------------------------
    // Payments
    // ---------------------------------------------------------------------

    /// Persist a new payment; when `invoice_update` is given the guarded
    /// invoice write commits in the same atomic step or not at all.
    async fn insert_payment(
        &self,
        payment: &Payment,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, StoreError>;

    /// Lookup by the gateway's request id (webhook reconciliation path).
    async fn find_payment_by_gateway_id(
        &self,
        gateway_intent_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    async fn list_payments(
        &self,
        tenant_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, StoreError>;

    /// Guarded payment write, optionally with a guarded invoice write in
    /// the same atomic step.
    async fn update_payment(
        &self,
        payment: &Payment,
        expected_version: i64,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError>;

    // ---------------------------------------------------------------------
    // Refunds
    // ---------------------------------------------------------------------

    /// Persist a refund row together with the guarded payment update and,
    /// when the payment is linked to an invoice, the guarded invoice
    /// release, all in one atomic step.
    async fn insert_refund(
        &self,
        refund: &Refund,
        payment: &Payment,
        expected_payment_version: i64,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn refunds_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<Refund>, StoreError>;
}
