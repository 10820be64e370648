//! Payment ledger service.
//!
//! Owns the payment lifecycle: manually settled payments, gateway-initiated
//! payments reconciled by webhook, and refunds validated against the net
//! received amount. Gateway I/O always happens before the guarded write, so
//! no external call is ever in flight inside a storage transaction. When a
//! payment settles, the invoice balance moves in the same atomic commit as
//! the payment row.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use ledger_core::error::LedgerError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    CreateGatewayPayment, CreateManualPayment, Invoice, InvoiceStatus, ListPaymentsFilter,
    Payment, PaymentMethod, PaymentStatus, Refund,
};
use crate::money;
use crate::services::audit::{record_or_log, AuditContext, AuditRecord, AuditSink};
use crate::services::gateway::{ChargeRequest, PaymentGateway};
use crate::services::invoice_ledger::MAX_WRITE_ATTEMPTS;
use crate::services::metrics::{
    PAYMENTS_TOTAL, PAYMENT_AMOUNT_TOTAL, REFUNDS_TOTAL, WRITE_CONFLICTS_TOTAL,
};
use crate::services::sequencer;
use crate::storage::{InvoiceUpdate, LedgerStore, StoreError, UpdateOutcome};

/// Processor fee rate applied to gateway payments (2.9%).
const FEE_RATE: Decimal = Decimal::from_parts(29, 0, 0, false, 3);
/// Flat processor fee per gateway payment (0.30).
const FEE_FLAT: Decimal = Decimal::from_parts(30, 0, 0, false, 2);

/// Fee charged by the processor for a gateway payment, rounded to cents.
pub fn processor_fee(amount: Decimal) -> Decimal {
    money::round_to_cents(amount * FEE_RATE + FEE_FLAT)
}

/// Administrative override for a payment stuck in pending.
#[derive(Debug, Clone)]
pub enum PaymentResolution {
    Complete,
    Fail { reason: String },
}

/// Payment ledger service.
pub struct PaymentLedger {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    audit: Arc<dyn AuditSink>,
}

impl PaymentLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            gateway,
            audit,
        }
    }

    /// Record a manually settled payment (cash, check, bank transfer).
    ///
    /// Settles synchronously: the payment lands completed with no processor
    /// fee, and the linked invoice balance moves in the same commit.
    #[instrument(skip(self, input, ctx), fields(tenant_id = %input.tenant_id, customer_id = %input.customer_id))]
    pub async fn create_manual_payment(
        &self,
        input: CreateManualPayment,
        ctx: &AuditContext,
    ) -> Result<Payment, LedgerError> {
        if input.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(anyhow!(
                "payment amount must be positive, got {}",
                input.amount
            )));
        }
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

        let now = Utc::now();
        let mut payment = Payment {
            payment_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            invoice_id: input.invoice_id,
            payment_number: sequencer::payment_number(now),
            amount: input.amount,
            currency: input.currency,
            payment_method: input.payment_method.as_str().to_string(),
            status: PaymentStatus::Completed.as_str().to_string(),
            processor_fee: Some(Decimal::ZERO),
            net_amount: Some(input.amount),
            refunded_total: Decimal::ZERO,
            gateway_intent_id: None,
            failure_reason: None,
            metadata: input.metadata,
            row_version: 0,
            created_utc: now,
            completed_utc: Some(now),
            failed_utc: None,
            refunded_utc: None,
        };

        let Some(invoice_id) = input.invoice_id else {
            self.insert_unlinked(&mut payment, ctx).await?;
            return Ok(payment);
        };

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let invoice = self.load_invoice(input.tenant_id, invoice_id).await?;
            if invoice.parsed_status() == InvoiceStatus::Cancelled {
                return Err(LedgerError::InvalidState(anyhow!(
                    "cancelled invoice {} cannot receive payments",
                    invoice_id
                )));
            }
            if invoice.customer_id != input.customer_id {
                return Err(LedgerError::InvalidInput(anyhow!(
                    "invoice {} belongs to a different customer",
                    invoice_id
                )));
            }
            if input.amount > invoice.balance {
                return Err(LedgerError::ExceedsBalance(anyhow!(
                    "payment of {} exceeds invoice balance {}",
                    input.amount,
                    invoice.balance
                )));
            }

            let updated_invoice = invoice.with_payment_applied(input.amount, Utc::now())?;
            match self
                .store
                .insert_payment(
                    &payment,
                    Some(InvoiceUpdate {
                        invoice: &updated_invoice,
                        expected_version: invoice.row_version,
                    }),
                )
                .await
            {
                Ok(UpdateOutcome::Applied) => {
                    self.note_completed(&payment, ctx).await;
                    return Ok(payment);
                }
                Ok(UpdateOutcome::Conflict) => self.note_conflict("create_manual_payment").await,
                Err(StoreError::Duplicate("payment_number")) => {
                    payment.payment_number = sequencer::payment_number(Utc::now());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(concurrent_update_error(invoice_id))
    }

    /// Initiate a gateway payment against an invoice.
    ///
    /// Creates the external charge first, then records the payment as
    /// pending. The invoice balance is untouched until the gateway confirms
    /// through the webhook. Returns the payment and the gateway client
    /// secret for checkout.
    #[instrument(skip(self, input, ctx), fields(tenant_id = %input.tenant_id, invoice_id = %input.invoice_id))]
    pub async fn create_gateway_payment(
        &self,
        input: CreateGatewayPayment,
        ctx: &AuditContext,
    ) -> Result<(Payment, Option<String>), LedgerError> {
        if input.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(anyhow!(
                "payment amount must be positive, got {}",
                input.amount
            )));
        }
        let invoice = self.load_invoice(input.tenant_id, input.invoice_id).await?;
        if invoice.parsed_status() == InvoiceStatus::Cancelled {
            return Err(LedgerError::InvalidState(anyhow!(
                "cancelled invoice {} cannot receive payments",
                input.invoice_id
            )));
        }
        if input.amount > invoice.balance {
            return Err(LedgerError::ExceedsBalance(anyhow!(
                "payment of {} exceeds invoice balance {}",
                input.amount,
                invoice.balance
            )));
        }

        let intent = self
            .gateway
            .create_charge(&ChargeRequest {
                amount_minor: money::to_minor_units(input.amount)?,
                currency: invoice.currency.clone(),
                invoice_id: input.invoice_id.to_string(),
                tenant_id: input.tenant_id.to_string(),
            })
            .await?;

        let now = Utc::now();
        let mut payment = Payment {
            payment_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            customer_id: invoice.customer_id,
            invoice_id: Some(input.invoice_id),
            payment_number: sequencer::payment_number(now),
            amount: input.amount,
            currency: invoice.currency.clone(),
            payment_method: PaymentMethod::Card.as_str().to_string(),
            status: PaymentStatus::Pending.as_str().to_string(),
            processor_fee: None,
            net_amount: None,
            refunded_total: Decimal::ZERO,
            gateway_intent_id: Some(intent.gateway_request_id.clone()),
            failure_reason: None,
            metadata: input.metadata,
            row_version: 0,
            created_utc: now,
            completed_utc: None,
            failed_utc: None,
            refunded_utc: None,
        };

        self.insert_unlinked(&mut payment, ctx).await?;
        Ok((payment, intent.client_secret))
    }

    /// Settle a pending gateway payment after webhook confirmation.
    ///
    /// Unknown gateway ids are ignored (webhooks may arrive for foreign
    /// events); a repeated confirmation is a no-op. The invoice is credited
    /// with the full gross amount; the processor fee is tracked separately
    /// as the merchant's cost and caps future refunds.
    #[instrument(skip(self, ctx))]
    pub async fn confirm_gateway_payment(
        &self,
        gateway_request_id: &str,
        ctx: &AuditContext,
    ) -> Result<Option<Payment>, LedgerError> {
        let Some(payment) = self
            .store
            .find_payment_by_gateway_id(gateway_request_id)
            .await?
        else {
            warn!(
                gateway_request_id = gateway_request_id,
                "Webhook confirmation for unknown gateway request, ignoring"
            );
            return Ok(None);
        };

        match payment.parsed_status() {
            PaymentStatus::Pending => {}
            PaymentStatus::Completed | PaymentStatus::Refunded => {
                info!(
                    payment_id = %payment.payment_id,
                    "Duplicate webhook confirmation, payment already settled"
                );
                return Ok(Some(payment));
            }
            PaymentStatus::Failed => {
                return Err(LedgerError::InvalidState(anyhow!(
                    "payment {} already failed, cannot confirm",
                    payment.payment_id
                )));
            }
        }

        let fee = processor_fee(payment.amount);
        let net = payment.amount - fee;
        self.settle(payment, fee, net, ctx).await.map(Some)
    }

    /// Mark a pending gateway payment failed after webhook notification.
    #[instrument(skip(self, ctx))]
    pub async fn fail_gateway_payment(
        &self,
        gateway_request_id: &str,
        reason: &str,
        ctx: &AuditContext,
    ) -> Result<Option<Payment>, LedgerError> {
        let Some(payment) = self
            .store
            .find_payment_by_gateway_id(gateway_request_id)
            .await?
        else {
            warn!(
                gateway_request_id = gateway_request_id,
                "Webhook failure for unknown gateway request, ignoring"
            );
            return Ok(None);
        };

        match payment.parsed_status() {
            PaymentStatus::Pending => {}
            PaymentStatus::Failed => return Ok(Some(payment)),
            _ => {
                return Err(LedgerError::InvalidState(anyhow!(
                    "payment {} is {}, cannot mark failed",
                    payment.payment_id,
                    payment.status
                )));
            }
        }

        self.fail(payment, reason, ctx).await.map(Some)
    }

    /// Administrative override for a payment stuck in pending (a webhook
    /// that never arrived).
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, payment_id = %payment_id))]
    pub async fn resolve_pending(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        resolution: PaymentResolution,
        ctx: &AuditContext,
    ) -> Result<Payment, LedgerError> {
        let payment = self
            .store
            .get_payment(tenant_id, payment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(anyhow!("payment {} not found", payment_id)))?;
        if payment.parsed_status() != PaymentStatus::Pending {
            return Err(LedgerError::InvalidState(anyhow!(
                "payment {} is {}, only pending payments can be resolved",
                payment_id,
                payment.status
            )));
        }

        match resolution {
            PaymentResolution::Complete => {
                let (fee, net) = if payment.gateway_intent_id.is_some() {
                    let fee = processor_fee(payment.amount);
                    (fee, payment.amount - fee)
                } else {
                    (Decimal::ZERO, payment.amount)
                };
                self.settle(payment, fee, net, ctx).await
            }
            PaymentResolution::Fail { reason } => self.fail(payment, &reason, ctx).await,
        }
    }

    /// Refund part or all of a completed payment.
    ///
    /// The ceiling is the net received amount minus prior refunds: the
    /// processor fee is not recoverable, and refunding it would be an
    /// operating loss. The gateway refund runs before the local write; the
    /// refund row, payment counters and invoice release then commit
    /// together.
    #[instrument(skip(self, ctx), fields(tenant_id = %tenant_id, payment_id = %payment_id, amount = %amount))]
    pub async fn refund(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        reason: Option<String>,
        ctx: &AuditContext,
    ) -> Result<Refund, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(anyhow!(
                "refund amount must be positive, got {}",
                amount
            )));
        }

        let mut payment = self
            .store
            .get_payment(tenant_id, payment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(anyhow!("payment {} not found", payment_id)))?;
        validate_refundable(&payment, amount)?;

        let gateway_refund_id = match payment.gateway_intent_id {
            Some(ref intent_id) => Some(
                self.gateway
                    .refund(intent_id, money::to_minor_units(amount)?)
                    .await?
                    .gateway_refund_id,
            ),
            None => None,
        };

        let refund = Refund {
            refund_id: Uuid::new_v4(),
            tenant_id,
            payment_id,
            invoice_id: payment.invoice_id,
            amount,
            reason,
            gateway_refund_id,
            created_utc: Utc::now(),
        };

        for _ in 0..MAX_WRITE_ATTEMPTS {
            validate_refundable(&payment, amount)?;

            let now = Utc::now();
            let mut updated = payment.clone();
            updated.refunded_total += amount;
            if updated.refundable_remaining() <= Decimal::ZERO {
                updated.status = PaymentStatus::Refunded.as_str().to_string();
                updated.refunded_utc = Some(now);
            }
            updated.row_version += 1;

            let outcome = match payment.invoice_id {
                Some(invoice_id) => {
                    match self.store.get_invoice(tenant_id, invoice_id).await? {
                        Some(invoice) => {
                            let released = invoice.with_payment_released(amount, now)?;
                            self.store
                                .insert_refund(
                                    &refund,
                                    &updated,
                                    payment.row_version,
                                    Some(InvoiceUpdate {
                                        invoice: &released,
                                        expected_version: invoice.row_version,
                                    }),
                                )
                                .await?
                        }
                        None => {
                            warn!(
                                invoice_id = %invoice_id,
                                "Refunded payment references a missing invoice"
                            );
                            self.store
                                .insert_refund(&refund, &updated, payment.row_version, None)
                                .await?
                        }
                    }
                }
                None => {
                    self.store
                        .insert_refund(&refund, &updated, payment.row_version, None)
                        .await?
                }
            };

            match outcome {
                UpdateOutcome::Applied => {
                    REFUNDS_TOTAL.with_label_values(&[&payment.currency]).inc();
                    info!(
                        refund_id = %refund.refund_id,
                        payment_id = %payment_id,
                        amount = %amount,
                        "Refund recorded"
                    );
                    record_or_log(
                        self.audit.as_ref(),
                        AuditRecord::new(
                            "payment.refunded",
                            "payment",
                            payment_id,
                            tenant_id,
                            serde_json::to_value(&payment).ok(),
                            serde_json::to_value(&updated).ok(),
                            ctx,
                        ),
                    )
                    .await;
                    return Ok(refund);
                }
                UpdateOutcome::Conflict => {
                    self.note_conflict("refund").await;
                    payment = self
                        .store
                        .get_payment(tenant_id, payment_id)
                        .await?
                        .ok_or_else(|| {
                            LedgerError::NotFound(anyhow!("payment {} not found", payment_id))
                        })?;
                }
            }
        }
        Err(LedgerError::Conflict(anyhow!(
            "payment {} is under concurrent modification, retry",
            payment_id
        )))
    }

    pub async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Payment, LedgerError> {
        self.store
            .get_payment(tenant_id, payment_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(anyhow!("payment {} not found", payment_id)))
    }

    pub async fn list_payments(
        &self,
        tenant_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, LedgerError> {
        Ok(self.store.list_payments(tenant_id, filter).await?)
    }

    pub async fn refunds_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<Refund>, LedgerError> {
        Ok(self.store.refunds_for_payment(tenant_id, payment_id).await?)
    }

    /// Settle a pending payment: completed status, fee/net, and the gross
    /// amount applied to the linked invoice in the same commit.
    async fn settle(
        &self,
        mut payment: Payment,
        fee: Decimal,
        net: Decimal,
        ctx: &AuditContext,
    ) -> Result<Payment, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = Utc::now();
            let mut updated = payment.clone();
            updated.status = PaymentStatus::Completed.as_str().to_string();
            updated.processor_fee = Some(fee);
            updated.net_amount = Some(net);
            updated.completed_utc = Some(now);
            updated.row_version += 1;

            let outcome = match payment.invoice_id {
                Some(invoice_id) => {
                    match self.store.get_invoice(payment.tenant_id, invoice_id).await? {
                        Some(invoice) => {
                            // Gross, not net: the fee is the merchant's cost.
                            let applied = invoice.with_payment_applied(payment.amount, now)?;
                            self.store
                                .update_payment(
                                    &updated,
                                    payment.row_version,
                                    Some(InvoiceUpdate {
                                        invoice: &applied,
                                        expected_version: invoice.row_version,
                                    }),
                                )
                                .await?
                        }
                        None => {
                            warn!(
                                invoice_id = %invoice_id,
                                "Settling payment references a missing invoice"
                            );
                            self.store
                                .update_payment(&updated, payment.row_version, None)
                                .await?
                        }
                    }
                }
                None => {
                    self.store
                        .update_payment(&updated, payment.row_version, None)
                        .await?
                }
            };

            match outcome {
                UpdateOutcome::Applied => {
                    self.note_completed(&updated, ctx).await;
                    return Ok(updated);
                }
                UpdateOutcome::Conflict => {
                    self.note_conflict("settle_payment").await;
                    payment = self
                        .store
                        .get_payment(payment.tenant_id, payment.payment_id)
                        .await?
                        .ok_or_else(|| {
                            LedgerError::NotFound(anyhow!(
                                "payment {} not found",
                                payment.payment_id
                            ))
                        })?;
                    if payment.parsed_status() == PaymentStatus::Completed {
                        return Ok(payment);
                    }
                }
            }
        }
        Err(LedgerError::Conflict(anyhow!(
            "payment {} is under concurrent modification, retry",
            payment.payment_id
        )))
    }

    async fn fail(
        &self,
        mut payment: Payment,
        reason: &str,
        ctx: &AuditContext,
    ) -> Result<Payment, LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = Utc::now();
            let mut updated = payment.clone();
            updated.status = PaymentStatus::Failed.as_str().to_string();
            updated.failure_reason = Some(reason.to_string());
            updated.failed_utc = Some(now);
            updated.row_version += 1;

            match self
                .store
                .update_payment(&updated, payment.row_version, None)
                .await?
            {
                UpdateOutcome::Applied => {
                    PAYMENTS_TOTAL.with_label_values(&["failed"]).inc();
                    info!(
                        payment_id = %updated.payment_id,
                        reason = reason,
                        "Payment failed"
                    );
                    record_or_log(
                        self.audit.as_ref(),
                        AuditRecord::new(
                            "payment.failed",
                            "payment",
                            updated.payment_id,
                            updated.tenant_id,
                            serde_json::to_value(&payment).ok(),
                            serde_json::to_value(&updated).ok(),
                            ctx,
                        ),
                    )
                    .await;
                    return Ok(updated);
                }
                UpdateOutcome::Conflict => {
                    self.note_conflict("fail_payment").await;
                    payment = self
                        .store
                        .get_payment(payment.tenant_id, payment.payment_id)
                        .await?
                        .ok_or_else(|| {
                            LedgerError::NotFound(anyhow!(
                                "payment {} not found",
                                payment.payment_id
                            ))
                        })?;
                    if payment.parsed_status() == PaymentStatus::Failed {
                        return Ok(payment);
                    }
                }
            }
        }
        Err(LedgerError::Conflict(anyhow!(
            "payment {} is under concurrent modification, retry",
            payment.payment_id
        )))
    }

    /// Insert a payment with no invoice-side write, retrying number
    /// collisions.
    async fn insert_unlinked(
        &self,
        payment: &mut Payment,
        ctx: &AuditContext,
    ) -> Result<(), LedgerError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            match self.store.insert_payment(payment, None).await {
                Ok(UpdateOutcome::Applied) => {
                    if payment.parsed_status() == PaymentStatus::Completed {
                        self.note_completed(payment, ctx).await;
                    } else {
                        PAYMENTS_TOTAL.with_label_values(&["pending"]).inc();
                        record_or_log(
                            self.audit.as_ref(),
                            AuditRecord::new(
                                "payment.created",
                                "payment",
                                payment.payment_id,
                                payment.tenant_id,
                                None,
                                serde_json::to_value(&payment).ok(),
                                ctx,
                            ),
                        )
                        .await;
                    }
                    return Ok(());
                }
                Ok(UpdateOutcome::Conflict) => {
                    // No guarded rows were attached; treat as transient.
                    self.note_conflict("insert_payment").await;
                }
                Err(StoreError::Duplicate("payment_number")) => {
                    payment.payment_number = sequencer::payment_number(Utc::now());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LedgerError::Conflict(anyhow!(
            "could not persist payment {} after repeated attempts",
            payment.payment_id
        )))
    }

    async fn load_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, LedgerError> {
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

    async fn note_completed(&self, payment: &Payment, ctx: &AuditContext) {
        PAYMENTS_TOTAL.with_label_values(&["completed"]).inc();
        PAYMENT_AMOUNT_TOTAL
            .with_label_values(&[&payment.currency])
            .inc_by(payment.amount.to_f64().unwrap_or(0.0));
        info!(
            payment_id = %payment.payment_id,
            payment_number = %payment.payment_number,
            amount = %payment.amount,
            "Payment completed"
        );
        record_or_log(
            self.audit.as_ref(),
            AuditRecord::new(
                "payment.completed",
                "payment",
                payment.payment_id,
                payment.tenant_id,
                None,
                serde_json::to_value(payment).ok(),
                ctx,
            ),
        )
        .await;
    }

    async fn note_conflict(&self, operation: &str) {
        WRITE_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
        tokio::time::sleep(Duration::from_millis(sequencer::backoff_ms())).await;
    }
}

fn validate_refundable(payment: &Payment, amount: Decimal) -> Result<(), LedgerError> {
    match payment.parsed_status() {
        PaymentStatus::Completed => {}
        PaymentStatus::Refunded => {
            return Err(LedgerError::InvalidState(anyhow!(
                "payment {} is already fully refunded",
                payment.payment_id
            )));
        }
        other => {
            return Err(LedgerError::InvalidState(anyhow!(
                "payment {} is {}, only completed payments can be refunded",
                payment.payment_id,
                other
            )));
        }
    }
    let remaining = payment.refundable_remaining();
    if amount > remaining {
        return Err(LedgerError::ExceedsRefundable(anyhow!(
            "refund of {} exceeds refundable remainder {} (net received minus prior refunds)",
            amount,
            remaining
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
