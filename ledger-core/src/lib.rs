//! ledger-core: Shared infrastructure for the ledger engine crates.
pub mod config;
pub mod error;
pub mod observability;

pub use anyhow;
pub use tracing;
