//! Prometheus metrics for the ledger engine.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Invoice counter by status.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_invoices_total",
        "Total number of invoices by status",
        &["status"] // draft, sent, viewed, partially_paid, paid, cancelled
    )
    .expect("Failed to register invoices_total")
});

/// Payment counter by status.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_payments_total",
        "Total number of payments by status",
        &["status"]
    )
    .expect("Failed to register payments_total")
});

/// Refund counter by currency.
pub static REFUNDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_refunds_total",
        "Total number of refunds by currency",
        &["currency"]
    )
    .expect("Failed to register refunds_total")
});

/// Sequencer retry counter by resolution.
pub static SEQUENCER_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sequencer_retries_total",
        "Invoice number allocation retries by resolution",
        &["resolution"] // retried, fallback, exhausted
    )
    .expect("Failed to register sequencer_retries_total")
});

/// Guarded-write conflict counter by operation.
pub static WRITE_CONFLICTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_write_conflicts_total",
        "Row-version conflicts on guarded writes by operation",
        &["operation"]
    )
    .expect("Failed to register write_conflicts_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Payment amount counter by currency.
pub static PAYMENT_AMOUNT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_payment_amount_total",
        "Total payment amount by currency",
        &["currency"]
    )
    .expect("Failed to register payment_amount_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&REFUNDS_TOTAL);
    Lazy::force(&SEQUENCER_RETRIES_TOTAL);
    Lazy::force(&WRITE_CONFLICTS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PAYMENT_AMOUNT_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
