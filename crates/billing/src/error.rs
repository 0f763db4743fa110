//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ledger rejected request with status {status}: {body}")]
    LedgerRejected { status: u16, body: String },

    #[error("Malformed ledger response: {0}")]
    MalformedResponse(String),

    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid billing period: {0}")]
    InvalidPeriod(String),

    #[error("Usage aggregation failed: {0}")]
    Aggregation(String),

    #[error("{failed} debit submissions failed for {period}")]
    SubmissionsFailed { failed: usize, period: String },

    #[error("Billing run interrupted by shutdown")]
    Interrupted,
}

impl BillingError {
    /// Whether a failed ledger submission is worth retrying.
    ///
    /// Connection problems, timeouts, 5xx and 429 responses are transient.
    /// Everything else (4xx, bad payloads, signing failures) will fail the
    /// same way on the next attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            BillingError::LedgerRejected { status, .. } => *status >= 500 || *status == 429,
            BillingError::Database(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            _ => false,
        }
    }
}
