use thiserror::Error;

/// Error taxonomy for ledger operations.
///
/// Every ledger operation returns one of these kinds; the boundary layer
/// owns the mapping to transport-level responses. Financial-invariant
/// violations (`OverpaymentRejected`, `ExceedsBalance`, `ExceedsRefundable`)
/// are always rejected outright, never clamped.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid input: {0}")]
    InvalidInput(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Invalid state: {0}")]
    InvalidState(anyhow::Error),

    #[error("Overpayment rejected: {0}")]
    OverpaymentRejected(anyhow::Error),

    #[error("Exceeds balance: {0}")]
    ExceedsBalance(anyhow::Error),

    #[error("Exceeds refundable amount: {0}")]
    ExceedsRefundable(anyhow::Error),

    #[error("Sequencer exhausted: {0}")]
    SequencerExhausted(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Gateway error: {0}")]
    GatewayError(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        LedgerError::ConfigError(anyhow::Error::new(err))
    }
}

impl LedgerError {
    /// Whether the caller can fix the request and retry (4xx-equivalent).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidInput(_)
                | LedgerError::NotFound(_)
                | LedgerError::InvalidState(_)
                | LedgerError::OverpaymentRejected(_)
                | LedgerError::ExceedsBalance(_)
                | LedgerError::ExceedsRefundable(_)
        )
    }
}
