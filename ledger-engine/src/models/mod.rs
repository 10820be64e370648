//! Data model for the ledger engine.

pub mod customer;
pub mod invoice;
pub mod line_item;
pub mod payment;
pub mod quote;
pub mod refund;

pub use customer::Customer;
pub use invoice::{
    CreateInvoice, Invoice, InvoiceStatus, ListInvoicesFilter, UpdateInvoice,
};
pub use line_item::{LineItem, LineItemInput};
pub use payment::{
    CreateGatewayPayment, CreateManualPayment, ListPaymentsFilter, Payment, PaymentMethod,
    PaymentStatus,
};
pub use quote::{Quote, QuoteItem, QuoteStatus};
pub use refund::Refund;
