//! Invoice ledger service.
//!
//! Owns the invoice lifecycle: creation (from explicit line items or an
//! accepted quote), draft edits with append-only line-item re-versioning,
//! status transitions, soft deletion, and the balance-mutation primitive
//! `apply_payment`. Every write against an invoice row is a guarded
//! compare-and-swap retried a bounded number of times with randomized
//! backoff, so concurrent payments can never combine past the total.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use ledger_core::error::LedgerError;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::calculator::{self, InvoiceTotals, LineAmounts};
use crate::models::{
    CreateInvoice, Invoice, InvoiceStatus, LineItem, LineItemInput, ListInvoicesFilter,
    QuoteStatus, UpdateInvoice,
};
use crate::services::audit::{record_or_log, AuditContext, AuditRecord, AuditSink};
use crate::services::metrics::{INVOICES_TOTAL, SEQUENCER_RETRIES_TOTAL, WRITE_CONFLICTS_TOTAL};
use crate::services::sequencer::{self, NumberFormat, MAX_NUMBER_ATTEMPTS};
use crate::storage::{LedgerStore, StoreError, UpdateOutcome};

/// Guarded-write attempts before giving up with a conflict error.
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Invoice ledger service.
pub struct InvoiceLedger {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditSink>,
    number_format: NumberFormat,
}

impl InvoiceLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditSink>,
        number_format: NumberFormat,
    ) -> Self {
        Self {
            store,
            audit,
            number_format,
        }
    }

    /// Create a draft invoice, allocating the next sequential number.
    ///
    /// Line items come from the input, or are copied from the referenced
    /// quote when none are supplied. The quote must be accepted and not
    /// already converted (one invoice per quote).
    #[instrument(skip(self, input, ctx), fields(tenant_id = %input.tenant_id, customer_id = %input.customer_id))]
    pub async fn create_invoice(
        &self,
        input: CreateInvoice,
        ctx: &AuditContext,
    ) -> Result<Invoice, LedgerError> {
        if !self
            .store
            .customer_exists(input.tenant_id, input.customer_id)
            .await?
        {
            return Err(LedgerError::NotFound(anyhow!(
                "customer {} not found",
                input.customer_id
            )));
        }

        let mut item_inputs = input.line_items.clone();
        if let Some(quote_id) = input.quote_id {
            let quote = self
                .store
                .get_quote(input.tenant_id, quote_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(anyhow!("quote {} not found", quote_id)))?;
            if quote.parsed_status() != QuoteStatus::Accepted {
                return Err(LedgerError::InvalidState(anyhow!(
                    "quote {} is {}, only accepted quotes convert to invoices",
                    quote_id,
                    quote.status
                )));
            }
            if self.store.quote_converted(input.tenant_id, quote_id).await? {
                return Err(LedgerError::InvalidState(anyhow!(
                    "quote {} already has an invoice",
                    quote_id
                )));
            }
            if item_inputs.is_empty() {
                item_inputs = self
                    .store
                    .quote_items(input.tenant_id, quote_id)
                    .await?
                    .into_iter()
                    .map(|item| LineItemInput {
                        description: item.description,
                        quantity: item.quantity,
                        unit_price: item.unit_price,
                        discount_percent: item.discount_percent,
                        tax_rate: item.tax_rate,
                        sort_order: item.sort_order,
                    })
                    .collect();
            }
        }

        let (amounts, totals) = compute_amounts(&item_inputs)?;

        let deposit_required = input.deposit_required.unwrap_or(Decimal::ZERO);
        validate_deposit(deposit_required, totals.total)?;

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let mut invoice = Invoice {
            invoice_id,
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            quote_id: input.quote_id,
            invoice_number: String::new(),
            status: InvoiceStatus::Draft.as_str().to_string(),
            currency: input.currency,
            exchange_rate: input.exchange_rate.unwrap_or(Decimal::ONE),
            issue_date: input.issue_date.unwrap_or_else(|| now.date_naive()),
            due_date: input.due_date,
            subtotal: totals.subtotal,
            tax_total: totals.tax_total,
            total: totals.total,
            deposit_required,
            amount_paid: Decimal::ZERO,
            balance: totals.total,
            notes: input.notes,
            metadata: input.metadata,
            row_version: 0,
            created_utc: now,
            updated_utc: now,
            sent_utc: None,
            viewed_utc: None,
            cancelled_utc: None,
            deleted_utc: None,
        };

        let items: Vec<LineItem> = item_inputs
            .iter()
            .zip(amounts.iter())
            .map(|(item, amount)| {
                LineItem::from_input(input.tenant_id, invoice_id, item, amount, 1, now)
            })
            .collect();

        // Optimistic numbering: propose, insert, retry on a taken number.
        for attempt in 0..MAX_NUMBER_ATTEMPTS {
            let latest = self.store.latest_invoice_number(input.tenant_id).await?;
            invoice.invoice_number = self.number_format.next_candidate(latest.as_deref());

            match self.store.insert_invoice(&invoice, &items).await {
                Ok(()) => {
                    self.audit_created(&invoice, ctx).await;
                    return Ok(invoice);
                }
                Err(StoreError::Duplicate("invoice_number")) => {
                    SEQUENCER_RETRIES_TOTAL
                        .with_label_values(&["retried"])
                        .inc();
                    info!(
                        attempt = attempt + 1,
                        candidate = %invoice.invoice_number,
                        "Invoice number taken, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(sequencer::backoff_ms())).await;
                }
                Err(StoreError::Duplicate("quote_invoice")) => {
                    return Err(LedgerError::InvalidState(anyhow!(
                        "quote {} already has an invoice",
                        input.quote_id.map(|q| q.to_string()).unwrap_or_default()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Degraded mode: trade sequentiality for liveness.
        invoice.invoice_number = self.number_format.fallback(Utc::now());
        warn!(
            fallback = %invoice.invoice_number,
            "Invoice numbering exhausted retries, using timestamp fallback"
        );
        match self.store.insert_invoice(&invoice, &items).await {
            Ok(()) => {
                SEQUENCER_RETRIES_TOTAL
                    .with_label_values(&["fallback"])
                    .inc();
                self.audit_created(&invoice, ctx).await;
                Ok(invoice)
            }
            Err(StoreError::Duplicate(_)) => {
                SEQUENCER_RETRIES_TOTAL
                    .with_label_values(&["exhausted"])
                    .inc();
                Err(LedgerError::SequencerExhausted(anyhow!(
                    "could not allocate an invoice number for tenant {} after {} attempts",
                    input.tenant_id,
                    MAX_NUMBER_ATTEMPTS + 1
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch an invoice; soft-deleted rows read as absent.
    pub async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, LedgerError> {
        self.load(tenant_id, invoice_id).await
    }

    pub async fn list_invoices(
        &self,
        tenant_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, LedgerError> {
        Ok(self.store.list_invoices(tenant_id, filter).await?)
    }

    /// Latest-version line items for an invoice.
    pub async fn line_items(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<LineItem>, LedgerError> {
        self.load(tenant_id, invoice_id).await?;
        Ok(self.store.line_items(tenant_id, invoice_id, true).await?)
    }

    /// Full version history of an invoice's line items, superseded rows
    /// included.
    pub async fn line_item_history(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<LineItem>, LedgerError> {
        self.load(tenant_id, invoice_id).await?;
        Ok(self.store.line_items(tenant_id, invoice_id, false).await?)
    }

    /// Edit a draft invoice.
    ///
    /// Supplying line items re-versions the whole set: current rows are
    /// marked superseded, replacements are inserted with the next version.
    /// The balance is recomputed as `new_total - amount_paid`, preserving
    /// any payment already recorded against the draft.
    #[instrument(skip(self, changes, ctx), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn update_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        changes: UpdateInvoice,
        ctx: &AuditContext,
    ) -> Result<Invoice, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let invoice = self.load(tenant_id, invoice_id).await?;
            if invoice.parsed_status() != InvoiceStatus::Draft {
                return Err(LedgerError::InvalidState(anyhow!(
                    "only draft invoices can be updated, invoice {} is {}",
                    invoice_id,
                    invoice.status
                )));
            }

            let now = Utc::now();
            let mut updated = invoice.clone();

            let mut superseded: Vec<LineItem> = Vec::new();
            let mut inserted: Vec<LineItem> = Vec::new();
            if let Some(ref item_inputs) = changes.line_items {
                let (amounts, totals) = compute_amounts(item_inputs)?;

                let current = self.store.line_items(tenant_id, invoice_id, true).await?;
                let next_version = current.iter().map(|li| li.version).max().unwrap_or(0) + 1;

                inserted = item_inputs
                    .iter()
                    .zip(amounts.iter())
                    .map(|(item, amount)| {
                        LineItem::from_input(tenant_id, invoice_id, item, amount, next_version, now)
                    })
                    .collect();
                superseded = current
                    .iter()
                    .enumerate()
                    .map(|(i, row)| {
                        row.superseded(inserted.get(i).map(|li| li.line_item_id), now)
                    })
                    .collect();

                updated.subtotal = totals.subtotal;
                updated.tax_total = totals.tax_total;
                updated.total = totals.total;
            }

            if updated.total < updated.amount_paid {
                return Err(LedgerError::InvalidInput(anyhow!(
                    "new total {} is below the {} already paid",
                    updated.total,
                    updated.amount_paid
                )));
            }

            if let Some(due_date) = changes.due_date {
                updated.due_date = Some(due_date);
            }
            if let Some(notes) = changes.notes.clone() {
                updated.notes = Some(notes);
            }
            if let Some(metadata) = changes.metadata.clone() {
                updated.metadata = Some(metadata);
            }
            if let Some(deposit) = changes.deposit_required {
                updated.deposit_required = deposit;
            }
            validate_deposit(updated.deposit_required, updated.total)?;

            updated.balance = updated.total - updated.amount_paid;
            updated.row_version += 1;
            updated.updated_utc = now;

            match self
                .store
                .update_invoice(&updated, invoice.row_version, &superseded, &inserted)
                .await?
            {
                UpdateOutcome::Applied => {
                    record_or_log(
                        self.audit.as_ref(),
                        AuditRecord::new(
                            "invoice.updated",
                            "invoice",
                            invoice_id,
                            tenant_id,
                            serde_json::to_value(&invoice).ok(),
                            serde_json::to_value(&updated).ok(),
                            ctx,
                        ),
                    )
                    .await;
                    return Ok(updated);
                }
                UpdateOutcome::Conflict => {
                    self.note_conflict("update_invoice").await;
                }
            }
        }
        Err(concurrent_update_error(invoice_id))
    }

    /// Send a draft invoice. Structure freezes from here on; only status and
    /// payment fields may change.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn send_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        ctx: &AuditContext,
    ) -> Result<Invoice, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let invoice = self.load(tenant_id, invoice_id).await?;
            if invoice.parsed_status() != InvoiceStatus::Draft {
                return Err(LedgerError::InvalidState(anyhow!(
                    "only draft invoices can be sent, invoice {} is {}",
                    invoice_id,
                    invoice.status
                )));
            }

            let now = Utc::now();
            let mut updated = invoice.clone();
            updated.status = InvoiceStatus::Sent.as_str().to_string();
            updated.sent_utc = Some(now);
            updated.row_version += 1;
            updated.updated_utc = now;

            match self
                .store
                .update_invoice(&updated, invoice.row_version, &[], &[])
                .await?
            {
                UpdateOutcome::Applied => {
                    INVOICES_TOTAL.with_label_values(&["sent"]).inc();
                    self.audit_transition("invoice.sent", &invoice, &updated, ctx).await;
                    return Ok(updated);
                }
                UpdateOutcome::Conflict => self.note_conflict("send_invoice").await,
            }
        }
        Err(concurrent_update_error(invoice_id))
    }

    /// Record that the customer viewed the invoice. Idempotent once viewed.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn mark_viewed(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        ctx: &AuditContext,
    ) -> Result<Invoice, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let invoice = self.load(tenant_id, invoice_id).await?;
            match invoice.parsed_status() {
                InvoiceStatus::Viewed => return Ok(invoice),
                InvoiceStatus::Sent => {}
                other => {
                    return Err(LedgerError::InvalidState(anyhow!(
                        "invoice {} is {}, cannot mark viewed",
                        invoice_id,
                        other
                    )))
                }
            }

            let now = Utc::now();
            let mut updated = invoice.clone();
            updated.status = InvoiceStatus::Viewed.as_str().to_string();
            updated.viewed_utc = Some(now);
            updated.row_version += 1;
            updated.updated_utc = now;

            match self
                .store
                .update_invoice(&updated, invoice.row_version, &[], &[])
                .await?
            {
                UpdateOutcome::Applied => {
                    self.audit_transition("invoice.viewed", &invoice, &updated, ctx).await;
                    return Ok(updated);
                }
                UpdateOutcome::Conflict => self.note_conflict("mark_viewed").await,
            }
        }
        Err(concurrent_update_error(invoice_id))
    }

    /// Cancel an invoice. Idempotent when already cancelled; forbidden once
    /// paid or while any payment is recorded (refund first).
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn cancel_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        ctx: &AuditContext,
    ) -> Result<Invoice, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let invoice = self.load(tenant_id, invoice_id).await?;
            if invoice.parsed_status() == InvoiceStatus::Cancelled {
                return Ok(invoice);
            }
            if invoice.parsed_status() == InvoiceStatus::Paid {
                return Err(LedgerError::InvalidState(anyhow!(
                    "paid invoice {} cannot be cancelled",
                    invoice_id
                )));
            }
            if invoice.amount_paid > Decimal::ZERO {
                return Err(LedgerError::InvalidState(anyhow!(
                    "invoice {} has {} in recorded payments, refund before cancelling",
                    invoice_id,
                    invoice.amount_paid
                )));
            }

            let now = Utc::now();
            let mut updated = invoice.clone();
            updated.status = InvoiceStatus::Cancelled.as_str().to_string();
            updated.cancelled_utc = Some(now);
            updated.row_version += 1;
            updated.updated_utc = now;

            match self
                .store
                .update_invoice(&updated, invoice.row_version, &[], &[])
                .await?
            {
                UpdateOutcome::Applied => {
                    INVOICES_TOTAL.with_label_values(&["cancelled"]).inc();
                    self.audit_transition("invoice.cancelled", &invoice, &updated, ctx).await;
                    return Ok(updated);
                }
                UpdateOutcome::Conflict => self.note_conflict("cancel_invoice").await,
            }
        }
        Err(concurrent_update_error(invoice_id))
    }

    /// Soft-delete a draft invoice. The row keeps its history and number.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn delete_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        ctx: &AuditContext,
    ) -> Result<(), LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let invoice = self.load(tenant_id, invoice_id).await?;
            if invoice.parsed_status() != InvoiceStatus::Draft {
                return Err(LedgerError::InvalidState(anyhow!(
                    "only draft invoices can be deleted, invoice {} is {}",
                    invoice_id,
                    invoice.status
                )));
            }

            let now = Utc::now();
            let mut updated = invoice.clone();
            updated.deleted_utc = Some(now);
            updated.row_version += 1;
            updated.updated_utc = now;

            match self
                .store
                .update_invoice(&updated, invoice.row_version, &[], &[])
                .await?
            {
                UpdateOutcome::Applied => {
                    self.audit_transition("invoice.deleted", &invoice, &updated, ctx).await;
                    return Ok(());
                }
                UpdateOutcome::Conflict => self.note_conflict("delete_invoice").await,
            }
        }
        Err(concurrent_update_error(invoice_id))
    }

    /// Apply a payment amount to the invoice balance.
    ///
    /// The overpayment check and the balance write land in one guarded
    /// step: validation always runs against the row state the write is
    /// conditioned on, so concurrent callers serialize on the row version.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, invoice_id = %invoice_id, amount = %amount))]
    pub async fn apply_payment(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        ctx: &AuditContext,
    ) -> Result<Invoice, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let invoice = self.load(tenant_id, invoice_id).await?;
            let updated = invoice.with_payment_applied(amount, Utc::now())?;

            match self
                .store
                .update_invoice(&updated, invoice.row_version, &[], &[])
                .await?
            {
                UpdateOutcome::Applied => {
                    if updated.parsed_status() == InvoiceStatus::Paid {
                        INVOICES_TOTAL.with_label_values(&["paid"]).inc();
                    }
                    self.audit_transition("invoice.payment_applied", &invoice, &updated, ctx)
                        .await;
                    return Ok(updated);
                }
                UpdateOutcome::Conflict => self.note_conflict("apply_payment").await,
            }
        }
        Err(concurrent_update_error(invoice_id))
    }

    async fn load(&self, tenant_id: Uuid, invoice_id: Uuid) -> Result<Invoice, LedgerError> {
        let invoice = self
            .store
            .get_invoice(tenant_id, invoice_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(anyhow!("invoice {} not found", invoice_id)))?;
        if invoice.is_deleted() {
            return Err(LedgerError::NotFound(anyhow!(
                "invoice {} not found",
                invoice_id
            )));
        }
        Ok(invoice)
    }

    async fn note_conflict(&self, operation: &str) {
        WRITE_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
        tokio::time::sleep(Duration::from_millis(sequencer::backoff_ms())).await;
    }

    async fn audit_created(&self, invoice: &Invoice, ctx: &AuditContext) {
        INVOICES_TOTAL.with_label_values(&["draft"]).inc();
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            total = %invoice.total,
            "Invoice created"
        );
        record_or_log(
            self.audit.as_ref(),
            AuditRecord::new(
                "invoice.created",
                "invoice",
                invoice.invoice_id,
                invoice.tenant_id,
                None,
                serde_json::to_value(invoice).ok(),
                ctx,
            ),
        )
        .await;
    }

    async fn audit_transition(
        &self,
        action: &str,
        before: &Invoice,
        after: &Invoice,
        ctx: &AuditContext,
    ) {
        record_or_log(
            self.audit.as_ref(),
            AuditRecord::new(
                action,
                "invoice",
                after.invoice_id,
                after.tenant_id,
                serde_json::to_value(before).ok(),
                serde_json::to_value(after).ok(),
                ctx,
            ),
        )
        .await;
    }
}

fn compute_amounts(
    items: &[LineItemInput],
) -> Result<(Vec<LineAmounts>, InvoiceTotals), LedgerError> {
    let amounts = items
        .iter()
        .map(calculator::calculate_line)
        .collect::<Result<Vec<_>, _>>()?;
    let totals = calculator::aggregate_totals(&amounts);
    Ok((amounts, totals))
}

fn validate_deposit(deposit: Decimal, total: Decimal) -> Result<(), LedgerError> {
    if deposit < Decimal::ZERO || deposit > total {
        return Err(LedgerError::InvalidInput(anyhow!(
            "deposit {} must be between 0 and the invoice total {}",
            deposit,
            total
        )));
    }
    Ok(())
}

fn concurrent_update_error(invoice_id: Uuid) -> LedgerError {
    LedgerError::Conflict(anyhow!(
        "invoice {} is under concurrent modification, retry",
        invoice_id
    ))
}
