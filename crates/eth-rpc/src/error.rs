//! Error types for the JSON-RPC client.
//!
//! This module provides the error hierarchy for single-endpoint RPC
//! operations:
//!
//! - [`RpcError`] - The primary error type for all client operations
//! - [`RpcErrorDetail`] - Parsed JSON-RPC error objects from responses
//!
//! # Error Philosophy
//!
//! Transient failures (connection drops, rate limits) are retried inside the
//! client up to its throttle limit and only surface once retries are
//! exhausted. Everything else surfaces immediately so callers can fail over
//! to another endpoint.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`RpcError`].
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors that can occur when talking to a JSON-RPC endpoint.
///
/// # Categories
///
/// | Category | Variants | Typical Cause |
/// |----------|----------|---------------|
/// | Network | `Connection`, `Timeout`, `ServerError` | Endpoint unreachable, slow |
/// | Throttling | `ThrottleExhausted` | 429s, provider backpressure |
/// | Protocol | `Rpc`, `MethodNotSupported`, `Http` | Server rejected the request |
/// | Data | `Serialization`, `InvalidResponse`, `BatchShapeMismatch` | Malformed payloads |
/// | Usage | `InvalidConfig` | Programmer error |
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// Failed to establish a connection to the endpoint.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The wall-clock deadline for the whole attempt sequence elapsed.
    ///
    /// This is fatal for the call; the deadline covers every retry, so there
    /// is nothing left to wait for.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A connection-level failure with no HTTP response at all.
    ///
    /// Distinguished from [`RpcError::Connection`] because it occurs after a
    /// connection was established (reset, truncated body, TLS failure).
    #[error("server error: {0}")]
    ServerError(String),

    /// Non-2xx HTTP response (when pass-through was not requested).
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },

    /// The endpoint rate-limited us and every allowed attempt was consumed.
    #[error("rate limited after {attempts} attempts")]
    ThrottleExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// JSON-RPC error returned by the server.
    #[error("RPC error ({code}): {message}")]
    Rpc {
        /// JSON-RPC error code (e.g., -32601 for method not found).
        code: i64,
        /// Human-readable error message from the server.
        message: String,
        /// Optional additional data from the error response.
        data: Option<String>,
    },

    /// The requested RPC method is not supported by this endpoint.
    ///
    /// Split out from [`RpcError::Rpc`] because callers routinely branch on
    /// it (e.g., the chain API falls back from the `finalized` tag).
    #[error("method not supported: {method}")]
    MethodNotSupported {
        /// The method name that was not supported.
        method: String,
    },

    /// A batch response did not line up with the batch request.
    ///
    /// Either the response was not a JSON array, or its length differed from
    /// the number of requests sent. The batch scheduler treats this as the
    /// signal to stop probing larger batch sizes.
    #[error("batch response shape mismatch: sent {sent}, response {got}")]
    BatchShapeMismatch {
        /// Number of requests in the batch.
        sent: usize,
        /// Description of what came back ("non-array" or a length).
        got: String,
    },

    /// Failed to serialize a request or deserialize a response.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Response was valid JSON but had unexpected structure.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid configuration provided to the client.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The batch scheduler task is gone (client shut down).
    #[error("client closed")]
    Closed,
}

impl RpcError {
    /// Create an RPC error from code and message.
    #[must_use]
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Check if this error indicates the method is not supported.
    ///
    /// Returns `true` for both [`RpcError::MethodNotSupported`] and
    /// [`RpcError::Rpc`] with method-not-found error codes.
    #[must_use]
    pub const fn is_method_not_supported(&self) -> bool {
        match self {
            Self::MethodNotSupported { .. } => true,
            // -32601 = Method not found (JSON-RPC standard)
            // -32600 = Invalid request (some providers use this for unsupported methods)
            Self::Rpc { code, .. } => *code == -32601 || *code == -32600,
            _ => false,
        }
    }

    /// Check if this error is likely transient and worth a failover.
    ///
    /// The client has already exhausted its own retries by the time one of
    /// these surfaces; "retryable" here means "another endpoint might do
    /// better", which the connection pool uses to decide whether to walk on.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::Timeout(_)
            | Self::ServerError(_)
            | Self::ThrottleExhausted { .. } => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            Self::Rpc { code, .. } => {
                // Server overloaded or rate limited
                *code == -32005 // Limit exceeded
                    || *code == -32000 // Server error (generic)
            }
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONVERSIONS FROM reqwest ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_request() || err.is_body() || err.is_decode() {
            Self::ServerError(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RPC ERROR DETAILS
// ═══════════════════════════════════════════════════════════════════════════════

/// Detailed information from a JSON-RPC error response.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RpcErrorDetail {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl RpcErrorDetail {
    /// Convert this detail into an [`RpcError`].
    #[must_use]
    pub fn into_error(self, method: &str) -> RpcError {
        if self.code == -32601 || self.code == -32600 {
            return RpcError::MethodNotSupported {
                method: method.to_string(),
            };
        }

        RpcError::Rpc {
            code: self.code,
            message: self.message,
            data: self.data.map(|v| v.to_string()),
        }
    }
}

impl fmt::Display for RpcErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error ({}): {}", self.code, self.message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
