//! Error types for the chain API layer.

use thiserror::Error;

/// Result type alias using [`ChainApiError`].
pub type Result<T> = std::result::Result<T, ChainApiError>;

/// Errors from the connection pool and the Ethereum facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChainApiError {
    /// Error from the underlying RPC client.
    #[error(transparent)]
    Rpc(#[from] eth_rpc::RpcError),

    /// An endpoint reported a different chain than the first-joined one.
    ///
    /// This is a configuration error and fatal at init: mixing chains would
    /// corrupt indexed state.
    #[error("chain identity mismatch on {endpoint}: {field} expected {expected}, got {got}")]
    ChainMismatch {
        /// Endpoint that failed verification.
        endpoint: String,
        /// Which identity field differed (chainId, genesisHash, runtimeChain).
        field: &'static str,
        /// Value reported by the first-joined endpoint.
        expected: String,
        /// Value reported by the offending endpoint.
        got: String,
    },

    /// Every endpoint in the pool is currently unhealthy.
    #[error("no healthy endpoints available")]
    NoHealthyEndpoints,

    /// A pooled operation failed on every attempted endpoint.
    #[error("all endpoints failed after {attempts} attempts: {last_error}")]
    AllEndpointsFailed {
        /// Number of connection attempts walked.
        attempts: u32,
        /// The final error observed.
        last_error: String,
    },

    /// The chain does not have the requested block.
    #[error("block {0} not found")]
    MissingBlock(u64),

    /// Response was valid JSON but structurally unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// ABI loading or decoding failed.
    #[error("abi error: {0}")]
    Abi(String),

    /// Failed to serialize or deserialize a payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ChainApiError {
    /// Whether trying another endpoint could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc(e) => e.is_retryable(),
            Self::NoHealthyEndpoints | Self::AllEndpointsFailed { .. } => true,
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
