//! Refund integration tests.

mod common;

use common::{dec, line, TestApp};
use ledger_core::error::LedgerError;
use ledger_engine::models::{
    CreateGatewayPayment, CreateManualPayment, InvoiceStatus, Payment, PaymentMethod,
    PaymentStatus,
};
use uuid::Uuid;

/// Confirmed gateway payment of 100.00: fee 3.20, net 96.80.
async fn confirmed_gateway_payment(app: &TestApp, invoice_id: Uuid) -> Payment {
    let (payment, _) = app
        .payments
        .create_gateway_payment(
            CreateGatewayPayment {
                tenant_id: app.tenant_id,
                invoice_id,
                amount: dec("100.00"),
                metadata: None,
            },
            &app.ctx,
        )
        .await
        .unwrap();
    app.payments
        .confirm_gateway_payment(payment.gateway_intent_id.as_deref().unwrap(), &app.ctx)
        .await
        .unwrap()
        .expect("payment should settle")
}

#[tokio::test]
async fn refund_ceiling_is_net_amount() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "100.00", "0", "0")]).await;
    let payment = confirmed_gateway_payment(&app, invoice.invoice_id).await;

    // The 3.20 processor fee is not recoverable.
    let err = app
        .payments
        .refund(app.tenant_id, payment.payment_id, dec("96.81"), None, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ExceedsRefundable(_)));

    let refund = app
        .payments
        .refund(
            app.tenant_id,
            payment.payment_id,
            dec("96.80"),
            Some("customer request".to_string()),
            &app.ctx,
        )
        .await
        .unwrap();
    assert_eq!(refund.amount, dec("96.80"));
    assert!(refund.gateway_refund_id.is_some());

    let payment = app
        .payments
        .get_payment(app.tenant_id, payment.payment_id)
        .await
        .unwrap();
    assert_eq!(payment.parsed_status(), PaymentStatus::Refunded);
    assert_eq!(payment.refunded_total, dec("96.80"));

    // The invoice releases exactly the refunded amount.
    let invoice = app
        .invoices
        .get_invoice(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(invoice.amount_paid, dec("3.20"));
    assert_eq!(invoice.balance, dec("96.80"));
    assert_eq!(invoice.parsed_status(), InvoiceStatus::PartiallyPaid);

    // The gateway saw the refund in minor units.
    assert_eq!(app.gateway.refund_calls().len(), 1);
    assert_eq!(app.gateway.refund_calls()[0].1, 9680);
}

#[tokio::test]
async fn partial_refunds_accumulate_to_the_ceiling() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "100.00", "0", "0")]).await;
    let payment = confirmed_gateway_payment(&app, invoice.invoice_id).await;

    app.payments
        .refund(app.tenant_id, payment.payment_id, dec("50.00"), None, &app.ctx)
        .await
        .unwrap();

    // Partially refunded: still completed, remainder still refundable.
    let current = app
        .payments
        .get_payment(app.tenant_id, payment.payment_id)
        .await
        .unwrap();
    assert_eq!(current.parsed_status(), PaymentStatus::Completed);
    assert_eq!(current.refunded_total, dec("50.00"));

    let err = app
        .payments
        .refund(app.tenant_id, payment.payment_id, dec("46.81"), None, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ExceedsRefundable(_)));

    app.payments
        .refund(app.tenant_id, payment.payment_id, dec("46.80"), None, &app.ctx)
        .await
        .unwrap();

    let exhausted = app
        .payments
        .get_payment(app.tenant_id, payment.payment_id)
        .await
        .unwrap();
    assert_eq!(exhausted.parsed_status(), PaymentStatus::Refunded);

    // The ceiling is spent; nothing further can be refunded.
    let err = app
        .payments
        .refund(app.tenant_id, payment.payment_id, dec("0.01"), None, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    let refunds = app
        .payments
        .refunds_for_payment(app.tenant_id, payment.payment_id)
        .await
        .unwrap();
    assert_eq!(refunds.len(), 2);
}

#[tokio::test]
async fn manual_payment_refunds_up_to_gross() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "80.00", "0", "0")]).await;

    let payment = app
        .payments
        .create_manual_payment(
            CreateManualPayment {
                tenant_id: app.tenant_id,
                customer_id: app.customer_id,
                invoice_id: Some(invoice.invoice_id),
                amount: dec("80.00"),
                currency: "USD".to_string(),
                payment_method: PaymentMethod::Cash,
                metadata: None,
            },
            &app.ctx,
        )
        .await
        .unwrap();

    // No processor fee, so the whole amount comes back.
    let refund = app
        .payments
        .refund(app.tenant_id, payment.payment_id, dec("80.00"), None, &app.ctx)
        .await
        .unwrap();
    assert_eq!(refund.gateway_refund_id, None);

    let invoice = app
        .invoices
        .get_invoice(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(invoice.amount_paid, dec("0.00"));
    assert_eq!(invoice.balance, dec("80.00"));
    // With no payment left the invoice falls back to its pre-payment state.
    assert_eq!(invoice.parsed_status(), InvoiceStatus::Draft);
}

#[tokio::test]
async fn refund_requires_a_completed_payment() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "100.00", "0", "0")]).await;

    let (pending, _) = app
        .payments
        .create_gateway_payment(
            CreateGatewayPayment {
                tenant_id: app.tenant_id,
                invoice_id: invoice.invoice_id,
                amount: dec("100.00"),
                metadata: None,
            },
            &app.ctx,
        )
        .await
        .unwrap();

    let err = app
        .payments
        .refund(app.tenant_id, pending.payment_id, dec("10.00"), None, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    let err = app
        .payments
        .refund(app.tenant_id, Uuid::new_v4(), dec("10.00"), None, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn refund_amount_must_be_positive() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "100.00", "0", "0")]).await;
    let payment = confirmed_gateway_payment(&app, invoice.invoice_id).await;

    let err = app
        .payments
        .refund(app.tenant_id, payment.payment_id, dec("0"), None, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));
}

#[tokio::test]
async fn refund_reopens_a_paid_invoice_for_cancellation() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "80.00", "0", "0")]).await;
    app.invoices
        .send_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();

    let payment = app
        .payments
        .create_manual_payment(
            CreateManualPayment {
                tenant_id: app.tenant_id,
                customer_id: app.customer_id,
                invoice_id: Some(invoice.invoice_id),
                amount: dec("80.00"),
                currency: "USD".to_string(),
                payment_method: PaymentMethod::Check,
                metadata: None,
            },
            &app.ctx,
        )
        .await
        .unwrap();

    // Paid invoices cannot be cancelled until the payment comes back.
    let err = app
        .invoices
        .cancel_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    app.payments
        .refund(app.tenant_id, payment.payment_id, dec("80.00"), None, &app.ctx)
        .await
        .unwrap();

    let invoice_after = app
        .invoices
        .get_invoice(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(invoice_after.parsed_status(), InvoiceStatus::Sent);

    let cancelled = app
        .invoices
        .cancel_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();
    assert_eq!(cancelled.parsed_status(), InvoiceStatus::Cancelled);
}
