//! Request and response types for the JSON-RPC wire.
//!
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] - standard JSON-RPC 2.0 envelopes
//! - [`RequestOptions`] - per-call behavior flags (pass-through, processors)
//! - [`ProcessorVerdict`] - what a response processor asks the client to do

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RpcErrorDetail;

// ═══════════════════════════════════════════════════════════════════════════════
// JSON-RPC ENVELOPES
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0".
    pub jsonrpc: &'static str,
    /// Method name, e.g. `eth_getBlockByNumber`.
    pub method: String,
    /// Positional parameters.
    pub params: serde_json::Value,
    /// Correlation id; echoed back by the server.
    pub id: u64,
}

impl JsonRpcRequest {
    /// Create a new request envelope.
    #[must_use]
    pub const fn new(method: String, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    /// Correlation id matching the request.
    #[serde(default)]
    pub id: u64,
    /// Result payload on success.
    pub result: Option<serde_json::Value>,
    /// Error object on failure.
    pub error: Option<RpcErrorDetail>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PER-CALL OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// What a [`ResponseProcessor`] asks the client to do with a raw response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorVerdict {
    /// Accept the response as-is.
    Accept,
    /// Back off and retry, exactly as if the server had returned HTTP 429.
    Throttle,
}

/// Callback that inspects a raw response body before the client parses it.
///
/// Used by callers that can recognize provider-specific backpressure signals
/// hidden inside 200 responses.
pub type ResponseProcessor = Arc<dyn Fn(&serde_json::Value) -> ProcessorVerdict + Send + Sync>;

/// Per-call behavior flags.
#[derive(Default, Clone)]
pub struct RequestOptions {
    /// When `true`, non-2xx responses return their body to the caller as the
    /// result value instead of raising [`RpcError::Http`](crate::RpcError::Http).
    pub error_pass_through: bool,

    /// Optional processor run against the raw response body.
    ///
    /// A [`ProcessorVerdict::Throttle`] verdict takes the same backoff path
    /// as an HTTP 429, counting against the throttle limit.
    pub processor: Option<ResponseProcessor>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("error_pass_through", &self.error_pass_through)
            .field("processor", &self.processor.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RequestOptions {
    /// Options with pass-through enabled.
    #[must_use]
    pub fn pass_through() -> Self {
        Self {
            error_pass_through: true,
            processor: None,
        }
    }

    /// Attach a response processor.
    #[must_use]
    pub fn with_processor(mut self, processor: ResponseProcessor) -> Self {
        self.processor = Some(processor);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let request = JsonRpcRequest::new(
            "eth_blockNumber".into(),
            serde_json::Value::Array(vec![]),
            7,
        );
        let json = serde_json::to_string(&request).expect("serialization failed");

        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"eth_blockNumber\""));
        assert!(json.contains("\"id\":7"));
    }

    #[test]
    fn response_deserialization_result() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#;
        let response: JsonRpcResponse = serde_json::from_str(json).expect("parse failed");
        assert_eq!(response.id, 1);
        assert_eq!(response.result, Some(serde_json::json!("0x10")));
        assert!(response.error.is_none());
    }

    #[test]
    fn response_deserialization_error() {
        let json = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#;
        let response: JsonRpcResponse = serde_json::from_str(json).expect("parse failed");
        assert!(response.result.is_none());
        assert_eq!(response.error.map(|e| e.code), Some(-32601));
    }

    #[test]
    fn options_debug_does_not_print_closure() {
        let opts = RequestOptions::default()
            .with_processor(Arc::new(|_| ProcessorVerdict::Accept));
        let printed = format!("{opts:?}");
        assert!(printed.contains("<fn>"));
    }
}
