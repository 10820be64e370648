//! Shared test harness for ledger integration tests.
//!
//! Runs the ledgers over the in-memory store and the mock gateway, so the
//! suite exercises the full service logic without external services.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use ledger_engine::models::{
    CreateInvoice, Customer, Invoice, LineItemInput, Quote, QuoteItem,
};
use ledger_engine::services::audit::{AuditContext, TracingAuditSink};
use ledger_engine::services::gateway::MockGateway;
use ledger_engine::services::sequencer::NumberFormat;
use ledger_engine::services::{InvoiceLedger, PaymentLedger};
use ledger_engine::storage::{LedgerStore, MemStore};

pub struct TestApp {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub store: Arc<MemStore>,
    pub gateway: Arc<MockGateway>,
    pub invoices: InvoiceLedger,
    pub payments: PaymentLedger,
    pub ctx: AuditContext,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let store = Arc::new(MemStore::new());
        let gateway = Arc::new(MockGateway::new());
        let audit = Arc::new(TracingAuditSink);

        let tenant_id = Uuid::new_v4();
        let customer_id = Uuid::new_v4();
        let store_handle: Arc<dyn LedgerStore> = store.clone();
        store_handle
            .insert_customer(&Customer {
                customer_id,
                tenant_id,
                name: "Test Customer".to_string(),
                email: Some("customer@example.com".to_string()),
                created_utc: Utc::now(),
            })
            .await
            .expect("Failed to seed customer");

        let invoices = InvoiceLedger::new(
            store.clone(),
            audit.clone(),
            NumberFormat::default(),
        );
        let payments = PaymentLedger::new(store.clone(), gateway.clone(), audit.clone());

        Self {
            tenant_id,
            customer_id,
            store,
            gateway,
            invoices,
            payments,
            ctx: AuditContext::default(),
        }
    }

    /// Seed a second customer in the same tenant.
    pub async fn seed_customer(&self, name: &str) -> Uuid {
        let customer_id = Uuid::new_v4();
        let store: Arc<dyn LedgerStore> = self.store.clone();
        store
            .insert_customer(&Customer {
                customer_id,
                tenant_id: self.tenant_id,
                name: name.to_string(),
                email: None,
                created_utc: Utc::now(),
            })
            .await
            .expect("Failed to seed customer");
        customer_id
    }

    /// Seed a quote with the given status and items.
    pub async fn seed_quote(&self, status: &str, items: Vec<LineItemInput>) -> Uuid {
        let quote_id = Uuid::new_v4();
        let quote = Quote {
            quote_id,
            tenant_id: self.tenant_id,
            customer_id: self.customer_id,
            status: status.to_string(),
            currency: "USD".to_string(),
            created_utc: Utc::now(),
        };
        let quote_items: Vec<QuoteItem> = items
            .into_iter()
            .map(|item| QuoteItem {
                quote_item_id: Uuid::new_v4(),
                quote_id,
                tenant_id: self.tenant_id,
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price,
                discount_percent: item.discount_percent,
                tax_rate: item.tax_rate,
                sort_order: item.sort_order,
            })
            .collect();
        let store: Arc<dyn LedgerStore> = self.store.clone();
        store
            .insert_quote(&quote, &quote_items)
            .await
            .expect("Failed to seed quote");
        quote_id
    }

    /// Create a draft invoice for the default customer.
    pub async fn draft_invoice(&self, items: Vec<LineItemInput>) -> Invoice {
        self.invoices
            .create_invoice(self.create_input(items), &self.ctx)
            .await
            .expect("Failed to create invoice")
    }

    pub fn create_input(&self, items: Vec<LineItemInput>) -> CreateInvoice {
        CreateInvoice {
            tenant_id: self.tenant_id,
            customer_id: self.customer_id,
            quote_id: None,
            line_items: items,
            currency: "USD".to_string(),
            exchange_rate: None,
            issue_date: None,
            due_date: None,
            deposit_required: None,
            notes: None,
            metadata: None,
        }
    }
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("Invalid decimal literal")
}

pub fn line(quantity: &str, unit_price: &str, discount: &str, tax: &str) -> LineItemInput {
    LineItemInput {
        description: "Test line".to_string(),
        quantity: dec(quantity),
        unit_price: dec(unit_price),
        discount_percent: dec(discount),
        tax_rate: dec(tax),
        sort_order: 0,
    }
}
