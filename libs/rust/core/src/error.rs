//! Error taxonomy for the promotion workflow.
//!
//! Expected business outcomes (gate rejection, canary rollback) are not
//! errors; they come back as `PromotionOutcome` values. This type covers
//! what stops a run from reaching an outcome at all: infrastructure faults,
//! the in-flight guard, and invariant violations, which indicate state
//! corruption and are never auto-healed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromotionError {
    /// Serving runtime unreachable, reload timeout, ledger I/O failure.
    /// Retried a bounded number of times before being surfaced.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// The version store detected an impossible transition (e.g. two
    /// Actives). Fatal for the run; surfaced loudly, never corrected.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A candidate or canary is already in flight. Caller retries later.
    #[error("a promotion is already in progress")]
    AlreadyInProgress,
}

impl PromotionError {
    pub fn infra(e: impl std::fmt::Display) -> Self {
        Self::Infrastructure(e.to_string())
    }
}
