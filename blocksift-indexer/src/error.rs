//! Layered error types for the indexing core.
//!
//! # Error Philosophy
//!
//! Transient failures are recovered at the lowest layer that knows the
//! remedy: the RPC client retries, the pool fails over, the dictionary falls
//! back to dense fetching. Only errors that indicate a bug or a broken
//! deployment propagate to the process top:
//!
//! - [`IndexerError::InvariantViolation`] - upstream ordering bug
//! - [`IndexerError::HandlerFailure`] - a worker may never skip a height
//! - [`IndexerError::Config`] / [`IndexerError::Initialization`]
//!
//! A detected fork is *not* an error; it surfaces as a rewind height from
//! the unfinalized tracker.

use thiserror::Error;

/// Type alias for indexer Results.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Errors raised by the indexing core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IndexerError {
    /// Chain access failed (pool exhausted, RPC rejected, malformed data).
    #[error(transparent)]
    ChainApi(#[from] chain_api::ChainApiError),

    /// Metadata store failure.
    #[error("store error: {0}")]
    Store(String),

    /// The dictionary endpoint could not be reached or produced no usable
    /// response. Callers fall back to dense RPC fetching for the cycle.
    #[error("dictionary unavailable: {0}")]
    DictionaryUnavailable(String),

    /// The dictionary has not indexed far enough for the requested range.
    #[error("dictionary behind: last processed {last_processed}, need {required}")]
    DictionaryBehind {
        /// The dictionary's last indexed height.
        last_processed: u64,
        /// The height the caller needed.
        required: u64,
    },

    /// The dictionary answered with something structurally unusable.
    /// Logged and dropped; the caller falls back.
    #[error("malformed dictionary response: {0}")]
    DictionaryMalformed(String),

    /// An ordering invariant was violated. Fatal: indicates an upstream bug,
    /// continuing would corrupt indexed state.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A handler worker failed after internal retries. Fatal: the loop is
    /// not allowed to skip a height.
    #[error("handler failed at block {height}: {reason}")]
    HandlerFailure {
        /// Height the worker was processing.
        height: u64,
        /// Failure description.
        reason: String,
    },

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Initialization error.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Graceful shutdown requested.
    #[error("shutdown requested")]
    ShutdownRequested,
}

impl IndexerError {
    /// Whether this error must stop the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation(_)
                | Self::HandlerFailure { .. }
                | Self::Config(_)
                | Self::Initialization(_)
        )
    }

    /// Whether the dictionary path should fall back to dense fetching.
    #[must_use]
    pub const fn is_dictionary_fallback(&self) -> bool {
        matches!(
            self,
            Self::DictionaryUnavailable(_)
                | Self::DictionaryBehind { .. }
                | Self::DictionaryMalformed(_)
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classification() {
        assert!(IndexerError::InvariantViolation("out of order".into()).is_fatal());
        assert!(
            IndexerError::HandlerFailure {
                height: 7,
                reason: "boom".into()
            }
            .is_fatal()
        );
        assert!(!IndexerError::DictionaryUnavailable("timeout".into()).is_fatal());
        assert!(!IndexerError::ShutdownRequested.is_fatal());
    }

    #[test]
    fn dictionary_errors_fall_back() {
        assert!(
            IndexerError::DictionaryBehind {
                last_processed: 10,
                required: 100
            }
            .is_dictionary_fallback()
        );
        assert!(IndexerError::DictionaryMalformed("not json".into()).is_dictionary_fallback());
        assert!(!IndexerError::Store("locked".into()).is_dictionary_fallback());
    }
}
