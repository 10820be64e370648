//! In-memory store.
//!
//! The dependency-injection test double: identical compare-and-swap
//! semantics to the Postgres backend, with a single mutex standing in for
//! the database's transactional boundary. Also useful for ephemeral
//! environments where no database is provisioned.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    Customer, Invoice, LineItem, ListInvoicesFilter, ListPaymentsFilter, Payment, Quote,
    QuoteItem, Refund,
};
use crate::storage::{InvoiceUpdate, LedgerStore, StoreError, UpdateOutcome};

#[derive(Default)]
struct MemState {
    customers: HashMap<(Uuid, Uuid), Customer>,
    quotes: HashMap<(Uuid, Uuid), Quote>,
    quote_items: Vec<QuoteItem>,
    invoices: HashMap<Uuid, Invoice>,
    line_items: Vec<LineItem>,
    payments: HashMap<Uuid, Payment>,
    refunds: Vec<Refund>,
}

/// In-memory [`LedgerStore`] backend.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T: Clone>(rows: Vec<T>, page_size: i32) -> Vec<T> {
    let limit = page_size.clamp(1, 100) as usize;
    rows.into_iter().take(limit).collect()
}

#[async_trait]
impl LedgerStore for MemStore {
    async fn insert_customer(&self, customer: &Customer) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .customers
            .insert((customer.tenant_id, customer.customer_id), customer.clone());
        Ok(())
    }

    async fn customer_exists(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.customers.contains_key(&(tenant_id, customer_id)))
    }

    async fn insert_quote(&self, quote: &Quote, items: &[QuoteItem]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .quotes
            .insert((quote.tenant_id, quote.quote_id), quote.clone());
        state.quote_items.extend_from_slice(items);
        Ok(())
    }

    async fn get_quote(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Option<Quote>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.quotes.get(&(tenant_id, quote_id)).cloned())
    }

    async fn quote_items(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Vec<QuoteItem>, StoreError> {
        let state = self.state.lock().await;
        let mut items: Vec<QuoteItem> = state
            .quote_items
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.quote_id == quote_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sort_order);
        Ok(items)
    }

    async fn quote_converted(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .any(|inv| inv.tenant_id == tenant_id && inv.quote_id == Some(quote_id)))
    }

    async fn insert_invoice(
        &self,
        invoice: &Invoice,
        items: &[LineItem],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.invoices.values().any(|inv| {
            inv.tenant_id == invoice.tenant_id && inv.invoice_number == invoice.invoice_number
        }) {
            return Err(StoreError::Duplicate("invoice_number"));
        }
        if let Some(quote_id) = invoice.quote_id {
            if state
                .invoices
                .values()
                .any(|inv| inv.tenant_id == invoice.tenant_id && inv.quote_id == Some(quote_id))
            {
                return Err(StoreError::Duplicate("quote_invoice"));
            }
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        state.line_items.extend_from_slice(items);
        Ok(())
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .get(&invoice_id)
            .filter(|inv| inv.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_invoices(
        &self,
        tenant_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|inv| inv.tenant_id == tenant_id && !inv.is_deleted())
            .filter(|inv| {
                filter
                    .status
                    .map_or(true, |s| inv.status == s.as_str())
            })
            .filter(|inv| filter.customer_id.map_or(true, |c| inv.customer_id == c))
            .filter(|inv| filter.start_date.map_or(true, |d| inv.issue_date >= d))
            .filter(|inv| filter.end_date.map_or(true, |d| inv.issue_date <= d))
            .filter(|inv| filter.page_token.map_or(true, |t| inv.invoice_id > t))
            .cloned()
            .collect();
        rows.sort_by_key(|inv| inv.invoice_id);
        Ok(page(rows, filter.page_size))
    }

    async fn latest_invoice_number(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .filter(|inv| inv.tenant_id == tenant_id)
            .max_by(|a, b| {
                a.created_utc
                    .cmp(&b.created_utc)
                    .then_with(|| a.invoice_number.cmp(&b.invoice_number))
            })
            .map(|inv| inv.invoice_number.clone()))
    }

    async fn update_invoice(
        &self,
        invoice: &Invoice,
        expected_version: i64,
        superseded: &[LineItem],
        inserted: &[LineItem],
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.invoices.get(&invoice.invoice_id) {
            Some(current)
                if current.tenant_id == invoice.tenant_id
                    && current.row_version == expected_version => {}
            Some(_) => return Ok(UpdateOutcome::Conflict),
            None => {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "invoice {} vanished during guarded update",
                    invoice.invoice_id
                )))
            }
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        for row in superseded {
            if let Some(existing) = state
                .line_items
                .iter_mut()
                .find(|li| li.line_item_id == row.line_item_id)
            {
                *existing = row.clone();
            }
        }
        state.line_items.extend_from_slice(inserted);
        Ok(UpdateOutcome::Applied)
    }

    async fn line_items(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        latest_only: bool,
    ) -> Result<Vec<LineItem>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<LineItem> = state
            .line_items
            .iter()
            .filter(|li| li.tenant_id == tenant_id && li.invoice_id == invoice_id)
            .filter(|li| !latest_only || li.is_latest_version)
            .cloned()
            .collect();
        rows.sort_by_key(|li| (li.version, li.sort_order));
        Ok(rows)
    }

    async fn insert_payment(
        &self,
        payment: &Payment,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .payments
            .values()
            .any(|p| p.payment_number == payment.payment_number)
        {
            return Err(StoreError::Duplicate("payment_number"));
        }
        if let Some(ref update) = invoice_update {
            match state.invoices.get(&update.invoice.invoice_id) {
                Some(current) if current.row_version == update.expected_version => {}
                _ => return Ok(UpdateOutcome::Conflict),
            }
        }
        state.payments.insert(payment.payment_id, payment.clone());
        if let Some(update) = invoice_update {
            state
                .invoices
                .insert(update.invoice.invoice_id, update.invoice.clone());
        }
        Ok(UpdateOutcome::Applied)
    }

    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .get(&payment_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_payment_by_gateway_id(
        &self,
        gateway_intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.gateway_intent_id.as_deref() == Some(gateway_intent_id))
            .cloned())
    }

    async fn list_payments(
        &self,
        tenant_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .filter(|p| filter.status.map_or(true, |s| p.status == s.as_str()))
            .filter(|p| filter.customer_id.map_or(true, |c| p.customer_id == c))
            .filter(|p| filter.invoice_id.map_or(true, |i| p.invoice_id == Some(i)))
            .filter(|p| filter.page_token.map_or(true, |t| p.payment_id > t))
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.payment_id);
        Ok(page(rows, filter.page_size))
    }

    async fn update_payment(
        &self,
        payment: &Payment,
        expected_version: i64,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.payments.get(&payment.payment_id) {
            Some(current) if current.row_version == expected_version => {}
            Some(_) => return Ok(UpdateOutcome::Conflict),
            None => {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "payment {} vanished during guarded update",
                    payment.payment_id
                )))
            }
        }
        if let Some(ref update) = invoice_update {
            match state.invoices.get(&update.invoice.invoice_id) {
                Some(current) if current.row_version == update.expected_version => {}
                _ => return Ok(UpdateOutcome::Conflict),
            }
        }
        state.payments.insert(payment.payment_id, payment.clone());
        if let Some(update) = invoice_update {
            state
                .invoices
                .insert(update.invoice.invoice_id, update.invoice.clone());
        }
        Ok(UpdateOutcome::Applied)
    }

    async fn insert_refund(
        &self,
        refund: &Refund,
        payment: &Payment,
        expected_payment_version: i64,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.payments.get(&payment.payment_id) {
            Some(current) if current.row_version == expected_payment_version => {}
            Some(_) => return Ok(UpdateOutcome::Conflict),
            None => {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "payment {} vanished during refund",
                    payment.payment_id
                )))
            }
        }
        if let Some(ref update) = invoice_update {
            match state.invoices.get(&update.invoice.invoice_id) {
                Some(current) if current.row_version == update.expected_version => {}
                _ => return Ok(UpdateOutcome::Conflict),
            }
        }
        state.refunds.push(refund.clone());
        state.payments.insert(payment.payment_id, payment.clone());
        if let Some(update) = invoice_update {
            state
                .invoices
                .insert(update.invoice.invoice_id, update.invoice.clone());
        }
        Ok(UpdateOutcome::Applied)
    }

    async fn refunds_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<Refund>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Refund> = state
            .refunds
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.payment_id == payment_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_utc);
        Ok(rows)
    }
}
