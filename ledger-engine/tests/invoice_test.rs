//! Invoice lifecycle integration tests.

mod common;

use common::{dec, line, TestApp};
use ledger_core::error::LedgerError;
use ledger_engine::models::{InvoiceStatus, ListInvoicesFilter, UpdateInvoice};
use uuid::Uuid;

#[tokio::test]
async fn create_invoice_computes_totals() {
    let app = TestApp::spawn().await;

    let invoice = app
        .draft_invoice(vec![line("10", "25.00", "10", "13")])
        .await;

    assert_eq!(invoice.invoice_number, "INV-000001");
    assert_eq!(invoice.parsed_status(), InvoiceStatus::Draft);
    assert_eq!(invoice.subtotal, dec("225.00"));
    assert_eq!(invoice.tax_total, dec("29.25"));
    assert_eq!(invoice.total, dec("254.25"));
    assert_eq!(invoice.amount_paid, dec("0"));
    assert_eq!(invoice.balance, dec("254.25"));
}

#[tokio::test]
async fn invoice_numbers_are_sequential() {
    let app = TestApp::spawn().await;

    let first = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;
    let second = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;
    let third = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;

    assert_eq!(first.invoice_number, "INV-000001");
    assert_eq!(second.invoice_number, "INV-000002");
    assert_eq!(third.invoice_number, "INV-000003");
}

#[tokio::test]
async fn deposit_must_stay_within_total() {
    let app = TestApp::spawn().await;

    let mut input = app.create_input(vec![line("1", "100.00", "0", "0")]);
    input.deposit_required = Some(dec("150.00"));
    let err = app
        .invoices
        .create_invoice(input, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidInput(_)));

    let mut input = app.create_input(vec![line("1", "100.00", "0", "0")]);
    input.deposit_required = Some(dec("50.00"));
    let invoice = app.invoices.create_invoice(input, &app.ctx).await.unwrap();
    assert_eq!(invoice.deposit_required, dec("50.00"));
    // Balance derives from payments, never from the deposit.
    assert_eq!(invoice.balance, dec("100.00"));
}

#[tokio::test]
async fn unknown_customer_is_rejected() {
    let app = TestApp::spawn().await;

    let mut input = app.create_input(vec![line("1", "10.00", "0", "0")]);
    input.customer_id = Uuid::new_v4();
    let err = app
        .invoices
        .create_invoice(input, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn accepted_quote_converts_once() {
    let app = TestApp::spawn().await;
    let quote_id = app
        .seed_quote("accepted", vec![line("4", "50.00", "0", "10")])
        .await;

    let mut input = app.create_input(vec![]);
    input.quote_id = Some(quote_id);
    let invoice = app.invoices.create_invoice(input, &app.ctx).await.unwrap();

    // Items copied from the quote: 4 * 50.00 = 200.00 + 10% tax.
    assert_eq!(invoice.subtotal, dec("200.00"));
    assert_eq!(invoice.total, dec("220.00"));
    let items = app
        .invoices
        .line_items(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);

    // Second conversion of the same quote is rejected.
    let mut input = app.create_input(vec![]);
    input.quote_id = Some(quote_id);
    let err = app
        .invoices
        .create_invoice(input, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
}

#[tokio::test]
async fn unaccepted_quote_does_not_convert() {
    let app = TestApp::spawn().await;
    let quote_id = app
        .seed_quote("sent", vec![line("1", "10.00", "0", "0")])
        .await;

    let mut input = app.create_input(vec![]);
    input.quote_id = Some(quote_id);
    let err = app
        .invoices
        .create_invoice(input, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    let mut input = app.create_input(vec![]);
    input.quote_id = Some(Uuid::new_v4());
    let err = app
        .invoices
        .create_invoice(input, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn explicit_items_override_quote_items() {
    let app = TestApp::spawn().await;
    let quote_id = app
        .seed_quote("accepted", vec![line("4", "50.00", "0", "0")])
        .await;

    let mut input = app.create_input(vec![line("1", "75.00", "0", "0")]);
    input.quote_id = Some(quote_id);
    let invoice = app.invoices.create_invoice(input, &app.ctx).await.unwrap();
    assert_eq!(invoice.total, dec("75.00"));
}

#[tokio::test]
async fn update_reversions_line_items() {
    let app = TestApp::spawn().await;
    let invoice = app
        .draft_invoice(vec![
            line("1", "100.00", "0", "0"),
            line("2", "25.00", "0", "0"),
        ])
        .await;
    assert_eq!(invoice.total, dec("150.00"));

    let changes = UpdateInvoice {
        line_items: Some(vec![
            line("1", "80.00", "0", "0"),
            line("1", "20.00", "0", "0"),
            line("3", "10.00", "0", "0"),
        ]),
        ..Default::default()
    };
    let updated = app
        .invoices
        .update_invoice(app.tenant_id, invoice.invoice_id, changes, &app.ctx)
        .await
        .unwrap();
    assert_eq!(updated.total, dec("130.00"));

    // Never deletes: history strictly grows, exactly the new set is latest.
    let history = app
        .invoices
        .line_item_history(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 5);

    let latest = app
        .invoices
        .line_items(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(latest.len(), 3);
    assert!(latest.iter().all(|li| li.version == 2 && li.is_latest_version));

    let superseded: Vec<_> = history.iter().filter(|li| !li.is_latest_version).collect();
    assert_eq!(superseded.len(), 2);
    assert!(superseded.iter().all(|li| li.superseded_utc.is_some()));
    assert!(superseded.iter().all(|li| li.superseded_by.is_some()));
}

#[tokio::test]
async fn repeated_updates_keep_growing_history() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;

    for price in ["20.00", "30.00", "40.00"] {
        let changes = UpdateInvoice {
            line_items: Some(vec![line("1", price, "0", "0")]),
            ..Default::default()
        };
        app.invoices
            .update_invoice(app.tenant_id, invoice.invoice_id, changes, &app.ctx)
            .await
            .unwrap();
    }

    let history = app
        .invoices
        .line_item_history(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 4);
    let latest: Vec<_> = history.iter().filter(|li| li.is_latest_version).collect();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].version, 4);
    assert_eq!(latest[0].unit_price, dec("40.00"));
}

#[tokio::test]
async fn update_requires_draft() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;
    app.invoices
        .send_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();

    let changes = UpdateInvoice {
        notes: Some("too late".to_string()),
        ..Default::default()
    };
    let err = app
        .invoices
        .update_invoice(app.tenant_id, invoice.invoice_id, changes, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
}

#[tokio::test]
async fn send_and_view_transitions() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;

    let sent = app
        .invoices
        .send_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();
    assert_eq!(sent.parsed_status(), InvoiceStatus::Sent);
    assert!(sent.sent_utc.is_some());

    // Sending twice is an invalid transition.
    let err = app
        .invoices
        .send_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    let viewed = app
        .invoices
        .mark_viewed(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();
    assert_eq!(viewed.parsed_status(), InvoiceStatus::Viewed);

    // Marking viewed again is a no-op.
    let again = app
        .invoices
        .mark_viewed(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();
    assert_eq!(again.row_version, viewed.row_version);
}

#[tokio::test]
async fn cancel_is_guarded_and_idempotent() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;
    app.invoices
        .send_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();

    let cancelled = app
        .invoices
        .cancel_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();
    assert_eq!(cancelled.parsed_status(), InvoiceStatus::Cancelled);

    // Idempotent: a second cancel returns the cancelled invoice unchanged.
    let again = app
        .invoices
        .cancel_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();
    assert_eq!(again.row_version, cancelled.row_version);
}

#[tokio::test]
async fn paid_or_partially_paid_invoices_cannot_be_cancelled() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "100.00", "0", "0")]).await;
    app.invoices
        .send_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();
    app.invoices
        .apply_payment(app.tenant_id, invoice.invoice_id, dec("40.00"), &app.ctx)
        .await
        .unwrap();

    let err = app
        .invoices
        .cancel_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
}

#[tokio::test]
async fn balance_invariant_holds_after_every_operation() {
    let app = TestApp::spawn().await;
    let invoice = app
        .draft_invoice(vec![line("10", "25.00", "10", "13")])
        .await;
    assert_eq!(invoice.balance, invoice.total - invoice.amount_paid);

    let changes = UpdateInvoice {
        line_items: Some(vec![line("10", "30.00", "10", "13")]),
        ..Default::default()
    };
    let updated = app
        .invoices
        .update_invoice(app.tenant_id, invoice.invoice_id, changes, &app.ctx)
        .await
        .unwrap();
    assert_eq!(updated.balance, updated.total - updated.amount_paid);

    let paid = app
        .invoices
        .apply_payment(app.tenant_id, invoice.invoice_id, dec("100.00"), &app.ctx)
        .await
        .unwrap();
    assert_eq!(paid.balance, paid.total - paid.amount_paid);
}

#[tokio::test]
async fn apply_payment_drives_status_to_paid() {
    let app = TestApp::spawn().await;
    let invoice = app
        .draft_invoice(vec![line("10", "25.00", "10", "13")])
        .await;

    let partial = app
        .invoices
        .apply_payment(app.tenant_id, invoice.invoice_id, dec("200.00"), &app.ctx)
        .await
        .unwrap();
    assert_eq!(partial.parsed_status(), InvoiceStatus::PartiallyPaid);
    assert_eq!(partial.balance, dec("54.25"));

    let paid = app
        .invoices
        .apply_payment(app.tenant_id, invoice.invoice_id, dec("54.25"), &app.ctx)
        .await
        .unwrap();
    assert_eq!(paid.parsed_status(), InvoiceStatus::Paid);
    assert_eq!(paid.balance, dec("0"));

    // One cent past the total is rejected outright.
    let err = app
        .invoices
        .apply_payment(app.tenant_id, invoice.invoice_id, dec("0.01"), &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::OverpaymentRejected(_)));
}

#[tokio::test]
async fn cancelled_invoice_rejects_payment_application() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;
    app.invoices
        .cancel_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();

    let err = app
        .invoices
        .apply_payment(app.tenant_id, invoice.invoice_id, dec("5.00"), &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
}

#[tokio::test]
async fn soft_delete_hides_draft_invoices() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;

    app.invoices
        .delete_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();

    let err = app
        .invoices
        .get_invoice(app.tenant_id, invoice.invoice_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));

    let listed = app
        .invoices
        .list_invoices(
            app.tenant_id,
            &ListInvoicesFilter {
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn sent_invoices_cannot_be_deleted() {
    let app = TestApp::spawn().await;
    let invoice = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;
    app.invoices
        .send_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap();

    let err = app
        .invoices
        .delete_invoice(app.tenant_id, invoice.invoice_id, &app.ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
}

#[tokio::test]
async fn list_invoices_filters_by_status_and_customer() {
    let app = TestApp::spawn().await;
    let other_customer = app.seed_customer("Other Co").await;

    let first = app.draft_invoice(vec![line("1", "10.00", "0", "0")]).await;
    app.invoices
        .send_invoice(app.tenant_id, first.invoice_id, &app.ctx)
        .await
        .unwrap();
    app.draft_invoice(vec![line("1", "20.00", "0", "0")]).await;

    let mut input = app.create_input(vec![line("1", "30.00", "0", "0")]);
    input.customer_id = other_customer;
    app.invoices.create_invoice(input, &app.ctx).await.unwrap();

    let sent_only = app
        .invoices
        .list_invoices(
            app.tenant_id,
            &ListInvoicesFilter {
                status: Some(InvoiceStatus::Sent),
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sent_only.len(), 1);
    assert_eq!(sent_only[0].invoice_id, first.invoice_id);

    let for_other = app
        .invoices
        .list_invoices(
            app.tenant_id,
            &ListInvoicesFilter {
                customer_id: Some(other_customer),
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(for_other.len(), 1);

    // Cross-tenant reads see nothing.
    let foreign = app
        .invoices
        .list_invoices(
            Uuid::new_v4(),
            &ListInvoicesFilter {
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(foreign.is_empty());
}
