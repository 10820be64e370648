//! PostgreSQL store.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    Customer, Invoice, LineItem, ListInvoicesFilter, ListPaymentsFilter, Payment, Quote,
    QuoteItem, Refund,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::storage::{InvoiceUpdate, LedgerStore, StoreError, UpdateOutcome};

/// Database connection pool wrapper implementing [`LedgerStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, StoreError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, customer_id, quote_id, invoice_number, \
    status, currency, exchange_rate, issue_date, due_date, subtotal, tax_total, total, \
    deposit_required, amount_paid, balance, notes, metadata, row_version, created_utc, \
    updated_utc, sent_utc, viewed_utc, cancelled_utc, deleted_utc";

const LINE_ITEM_COLUMNS: &str = "line_item_id, invoice_id, tenant_id, description, quantity, \
    unit_price, discount_percent, tax_rate, discount_amount, subtotal, tax_amount, total, \
    version, is_latest_version, superseded_utc, superseded_by, sort_order, created_utc";

const PAYMENT_COLUMNS: &str = "payment_id, tenant_id, customer_id, invoice_id, payment_number, \
    amount, currency, payment_method, status, processor_fee, net_amount, refunded_total, \
    gateway_intent_id, failure_reason, metadata, row_version, created_utc, completed_utc, \
    failed_utc, refunded_utc";

/// Guarded invoice UPDATE; returns whether the expected row version matched.
async fn guarded_invoice_write(
    conn: &mut sqlx::PgConnection,
    invoice: &Invoice,
    expected_version: i64,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET status = $4,
            currency = $5,
            exchange_rate = $6,
            issue_date = $7,
            due_date = $8,
            subtotal = $9,
            tax_total = $10,
            total = $11,
            deposit_required = $12,
            amount_paid = $13,
            balance = $14,
            notes = $15,
            metadata = $16,
            row_version = $17,
            updated_utc = $18,
            sent_utc = $19,
            viewed_utc = $20,
            cancelled_utc = $21,
            deleted_utc = $22
        WHERE tenant_id = $1 AND invoice_id = $2 AND row_version = $3
        "#,
    )
    .bind(invoice.tenant_id)
    .bind(invoice.invoice_id)
    .bind(expected_version)
    .bind(&invoice.status)
    .bind(&invoice.currency)
    .bind(invoice.exchange_rate)
    .bind(invoice.issue_date)
    .bind(invoice.due_date)
    .bind(invoice.subtotal)
    .bind(invoice.tax_total)
    .bind(invoice.total)
    .bind(invoice.deposit_required)
    .bind(invoice.amount_paid)
    .bind(invoice.balance)
    .bind(&invoice.notes)
    .bind(&invoice.metadata)
    .bind(invoice.row_version)
    .bind(invoice.updated_utc)
    .bind(invoice.sent_utc)
    .bind(invoice.viewed_utc)
    .bind(invoice.cancelled_utc)
    .bind(invoice.deleted_utc)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to update invoice: {}", e)))?;

    Ok(result.rows_affected() > 0)
}

/// Guarded payment UPDATE; returns whether the expected row version matched.
async fn guarded_payment_write(
    conn: &mut sqlx::PgConnection,
    payment: &Payment,
    expected_version: i64,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE payments
        SET status = $4,
            processor_fee = $5,
            net_amount = $6,
            refunded_total = $7,
            failure_reason = $8,
            metadata = $9,
            row_version = $10,
            completed_utc = $11,
            failed_utc = $12,
            refunded_utc = $13
        WHERE tenant_id = $1 AND payment_id = $2 AND row_version = $3
        "#,
    )
    .bind(payment.tenant_id)
    .bind(payment.payment_id)
    .bind(expected_version)
    .bind(&payment.status)
    .bind(payment.processor_fee)
    .bind(payment.net_amount)
    .bind(payment.refunded_total)
    .bind(&payment.failure_reason)
    .bind(&payment.metadata)
    .bind(payment.row_version)
    .bind(payment.completed_utc)
    .bind(payment.failed_utc)
    .bind(payment.refunded_utc)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to update payment: {}", e)))?;

    Ok(result.rows_affected() > 0)
}

async fn insert_line_item_row(
    conn: &mut sqlx::PgConnection,
    item: &LineItem,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO line_items (
            line_item_id, invoice_id, tenant_id, description, quantity, unit_price,
            discount_percent, tax_rate, discount_amount, subtotal, tax_amount, total,
            version, is_latest_version, superseded_utc, superseded_by, sort_order, created_utc
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(item.line_item_id)
    .bind(item.invoice_id)
    .bind(item.tenant_id)
    .bind(&item.description)
    .bind(item.quantity)
    .bind(item.unit_price)
    .bind(item.discount_percent)
    .bind(item.tax_rate)
    .bind(item.discount_amount)
    .bind(item.subtotal)
    .bind(item.tax_amount)
    .bind(item.total)
    .bind(item.version)
    .bind(item.is_latest_version)
    .bind(item.superseded_utc)
    .bind(item.superseded_by)
    .bind(item.sort_order)
    .bind(item.created_utc)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to insert line item: {}", e)))?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgStore {
    #[instrument(skip(self, customer), fields(tenant_id = %customer.tenant_id))]
    async fn insert_customer(&self, customer: &Customer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO customers (customer_id, tenant_id, name, email, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(customer.customer_id)
        .bind(customer.tenant_id)
        .bind(&customer.name)
        .bind(&customer.email)
        .bind(customer.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to insert customer: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    async fn customer_exists(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM customers WHERE tenant_id = $1 AND customer_id = $2)",
        )
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to check customer: {}", e)))?;
        Ok(exists)
    }

    #[instrument(skip(self, quote, items), fields(tenant_id = %quote.tenant_id))]
    async fn insert_quote(&self, quote: &Quote, items: &[QuoteItem]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO quotes (quote_id, tenant_id, customer_id, status, currency, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(quote.quote_id)
        .bind(quote.tenant_id)
        .bind(quote.customer_id)
        .bind(&quote.status)
        .bind(&quote.currency)
        .bind(quote.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to insert quote: {}", e)))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO quote_items (
                    quote_item_id, quote_id, tenant_id, description, quantity, unit_price,
                    discount_percent, tax_rate, sort_order
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(item.quote_item_id)
            .bind(item.quote_id)
            .bind(item.tenant_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.discount_percent)
            .bind(item.tax_rate)
            .bind(item.sort_order)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StoreError::Backend(anyhow::anyhow!("Failed to insert quote item: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, quote_id = %quote_id))]
    async fn get_quote(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Option<Quote>, StoreError> {
        let quote = sqlx::query_as::<_, Quote>(
            r#"
            SELECT quote_id, tenant_id, customer_id, status, currency, created_utc
            FROM quotes
            WHERE tenant_id = $1 AND quote_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(quote_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to get quote: {}", e)))?;
        Ok(quote)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, quote_id = %quote_id))]
    async fn quote_items(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Vec<QuoteItem>, StoreError> {
        let items = sqlx::query_as::<_, QuoteItem>(
            r#"
            SELECT quote_item_id, quote_id, tenant_id, description, quantity, unit_price,
                discount_percent, tax_rate, sort_order
            FROM quote_items
            WHERE tenant_id = $1 AND quote_id = $2
            ORDER BY sort_order
            "#,
        )
        .bind(tenant_id)
        .bind(quote_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to get quote items: {}", e)))?;
        Ok(items)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, quote_id = %quote_id))]
    async fn quote_converted(
        &self,
        tenant_id: Uuid,
        quote_id: Uuid,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM invoices WHERE tenant_id = $1 AND quote_id = $2)",
        )
        .bind(tenant_id)
        .bind(quote_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to check quote conversion: {}", e))
        })?;
        Ok(exists)
    }

    #[instrument(skip(self, invoice, items), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.invoice_id))]
    async fn insert_invoice(
        &self,
        invoice: &Invoice,
        items: &[LineItem],
    ) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO invoices ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25)
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice.invoice_id)
        .bind(invoice.tenant_id)
        .bind(invoice.customer_id)
        .bind(invoice.quote_id)
        .bind(&invoice.invoice_number)
        .bind(&invoice.status)
        .bind(&invoice.currency)
        .bind(invoice.exchange_rate)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(invoice.subtotal)
        .bind(invoice.tax_total)
        .bind(invoice.total)
        .bind(invoice.deposit_required)
        .bind(invoice.amount_paid)
        .bind(invoice.balance)
        .bind(&invoice.notes)
        .bind(&invoice.metadata)
        .bind(invoice.row_version)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .bind(invoice.sent_utc)
        .bind(invoice.viewed_utc)
        .bind(invoice.cancelled_utc)
        .bind(invoice.deleted_utc)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            return Err(match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    match db_err.constraint() {
                        Some("uq_invoices_tenant_quote") => StoreError::Duplicate("quote_invoice"),
                        _ => StoreError::Duplicate("invoice_number"),
                    }
                }
                _ => StoreError::Backend(anyhow::anyhow!("Failed to insert invoice: {}", e)),
            });
        }

        for item in items {
            insert_line_item_row(&mut tx, item).await?;
        }

        tx.commit().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(
            invoice_number = %invoice.invoice_number,
            line_items = items.len(),
            "Invoice persisted"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_invoices(
        &self,
        tenant_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status_str = filter.status.map(|s| s.as_str().to_string());

        let invoices = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Invoice>(&format!(
                r#"
                SELECT {}
                FROM invoices
                WHERE tenant_id = $1
                  AND deleted_utc IS NULL
                  AND ($2::varchar IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                  AND ($4::date IS NULL OR issue_date >= $4)
                  AND ($5::date IS NULL OR issue_date <= $5)
                  AND invoice_id > $6
                ORDER BY invoice_id
                LIMIT $7
                "#,
                INVOICE_COLUMNS
            ))
            .bind(tenant_id)
            .bind(&status_str)
            .bind(filter.customer_id)
            .bind(filter.start_date)
            .bind(filter.end_date)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Invoice>(&format!(
                r#"
                SELECT {}
                FROM invoices
                WHERE tenant_id = $1
                  AND deleted_utc IS NULL
                  AND ($2::varchar IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                  AND ($4::date IS NULL OR issue_date >= $4)
                  AND ($5::date IS NULL OR issue_date <= $5)
                ORDER BY invoice_id
                LIMIT $6
                "#,
                INVOICE_COLUMNS
            ))
            .bind(tenant_id)
            .bind(&status_str)
            .bind(filter.customer_id)
            .bind(filter.start_date)
            .bind(filter.end_date)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn latest_invoice_number(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        let number: Option<String> = sqlx::query_scalar(
            r#"
            SELECT invoice_number
            FROM invoices
            WHERE tenant_id = $1
            ORDER BY created_utc DESC, invoice_number DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to read latest invoice number: {}", e))
        })?;
        Ok(number)
    }

    #[instrument(skip(self, invoice, superseded, inserted), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.invoice_id))]
    async fn update_invoice(
        &self,
        invoice: &Invoice,
        expected_version: i64,
        superseded: &[LineItem],
        inserted: &[LineItem],
    ) -> Result<UpdateOutcome, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        if !guarded_invoice_write(&mut tx, invoice, expected_version).await? {
            tx.rollback().await.ok();
            return Ok(UpdateOutcome::Conflict);
        }

        for row in superseded {
            sqlx::query(
                r#"
                UPDATE line_items
                SET is_latest_version = FALSE,
                    superseded_utc = $2,
                    superseded_by = $3
                WHERE line_item_id = $1
                "#,
            )
            .bind(row.line_item_id)
            .bind(row.superseded_utc)
            .bind(row.superseded_by)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StoreError::Backend(anyhow::anyhow!("Failed to supersede line item: {}", e))
            })?;
        }

        for item in inserted {
            insert_line_item_row(&mut tx, item).await?;
        }

        tx.commit().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(UpdateOutcome::Applied)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn line_items(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        latest_only: bool,
    ) -> Result<Vec<LineItem>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, LineItem>(&format!(
            r#"
            SELECT {}
            FROM line_items
            WHERE tenant_id = $1
              AND invoice_id = $2
              AND ($3::bool = FALSE OR is_latest_version = TRUE)
            ORDER BY version, sort_order
            "#,
            LINE_ITEM_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(latest_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to get line items: {}", e)))?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self, payment, invoice_update), fields(tenant_id = %payment.tenant_id, payment_id = %payment.payment_id))]
    async fn insert_payment(
        &self,
        payment: &Payment,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        if let Some(ref update) = invoice_update {
            if !guarded_invoice_write(&mut tx, update.invoice, update.expected_version).await? {
                tx.rollback().await.ok();
                return Ok(UpdateOutcome::Conflict);
            }
        }

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO payments ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20)
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment.payment_id)
        .bind(payment.tenant_id)
        .bind(payment.customer_id)
        .bind(payment.invoice_id)
        .bind(&payment.payment_number)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.payment_method)
        .bind(&payment.status)
        .bind(payment.processor_fee)
        .bind(payment.net_amount)
        .bind(payment.refunded_total)
        .bind(&payment.gateway_intent_id)
        .bind(&payment.failure_reason)
        .bind(&payment.metadata)
        .bind(payment.row_version)
        .bind(payment.created_utc)
        .bind(payment.completed_utc)
        .bind(payment.failed_utc)
        .bind(payment.refunded_utc)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            return Err(match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    StoreError::Duplicate("payment_number")
                }
                _ => StoreError::Backend(anyhow::anyhow!("Failed to insert payment: {}", e)),
            });
        }

        tx.commit().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(payment_number = %payment.payment_number, "Payment persisted");
        Ok(UpdateOutcome::Applied)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, payment_id = %payment_id))]
    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE tenant_id = $1 AND payment_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to get payment: {}", e)))?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn find_payment_by_gateway_id(
        &self,
        gateway_intent_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE gateway_intent_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(gateway_intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to find payment by gateway id: {}", e))
        })?;
        Ok(payment)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_payments(
        &self,
        tenant_id: Uuid,
        filter: &ListPaymentsFilter,
    ) -> Result<Vec<Payment>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status_str = filter.status.map(|s| s.as_str().to_string());

        let payments = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Payment>(&format!(
                r#"
                SELECT {}
                FROM payments
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                  AND ($4::uuid IS NULL OR invoice_id = $4)
                  AND payment_id > $5
                ORDER BY payment_id
                LIMIT $6
                "#,
                PAYMENT_COLUMNS
            ))
            .bind(tenant_id)
            .bind(&status_str)
            .bind(filter.customer_id)
            .bind(filter.invoice_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Payment>(&format!(
                r#"
                SELECT {}
                FROM payments
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR customer_id = $3)
                  AND ($4::uuid IS NULL OR invoice_id = $4)
                ORDER BY payment_id
                LIMIT $5
                "#,
                PAYMENT_COLUMNS
            ))
            .bind(tenant_id)
            .bind(&status_str)
            .bind(filter.customer_id)
            .bind(filter.invoice_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to list payments: {}", e)))?;

        timer.observe_duration();
        Ok(payments)
    }

    #[instrument(skip(self, payment, invoice_update), fields(tenant_id = %payment.tenant_id, payment_id = %payment.payment_id))]
    async fn update_payment(
        &self,
        payment: &Payment,
        expected_version: i64,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        if !guarded_payment_write(&mut tx, payment, expected_version).await? {
            tx.rollback().await.ok();
            return Ok(UpdateOutcome::Conflict);
        }

        if let Some(ref update) = invoice_update {
            if !guarded_invoice_write(&mut tx, update.invoice, update.expected_version).await? {
                tx.rollback().await.ok();
                return Ok(UpdateOutcome::Conflict);
            }
        }

        tx.commit().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(UpdateOutcome::Applied)
    }

    #[instrument(skip(self, refund, payment, invoice_update), fields(tenant_id = %refund.tenant_id, payment_id = %refund.payment_id))]
    async fn insert_refund(
        &self,
        refund: &Refund,
        payment: &Payment,
        expected_payment_version: i64,
        invoice_update: Option<InvoiceUpdate<'_>>,
    ) -> Result<UpdateOutcome, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_refund"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        if !guarded_payment_write(&mut tx, payment, expected_payment_version).await? {
            tx.rollback().await.ok();
            return Ok(UpdateOutcome::Conflict);
        }

        if let Some(ref update) = invoice_update {
            if !guarded_invoice_write(&mut tx, update.invoice, update.expected_version).await? {
                tx.rollback().await.ok();
                return Ok(UpdateOutcome::Conflict);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO refunds (
                refund_id, tenant_id, payment_id, invoice_id, amount, reason,
                gateway_refund_id, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(refund.refund_id)
        .bind(refund.tenant_id)
        .bind(refund.payment_id)
        .bind(refund.invoice_id)
        .bind(refund.amount)
        .bind(&refund.reason)
        .bind(&refund.gateway_refund_id)
        .bind(refund.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to insert refund: {}", e)))?;

        tx.commit().await.map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        info!(refund_id = %refund.refund_id, amount = %refund.amount, "Refund persisted");
        Ok(UpdateOutcome::Applied)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, payment_id = %payment_id))]
    async fn refunds_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<Refund>, StoreError> {
        let refunds = sqlx::query_as::<_, Refund>(
            r#"
            SELECT refund_id, tenant_id, payment_id, invoice_id, amount, reason,
                gateway_refund_id, created_utc
            FROM refunds
            WHERE tenant_id = $1 AND payment_id = $2
            ORDER BY created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("Failed to get refunds: {}", e)))?;
        Ok(refunds)
    }
}
