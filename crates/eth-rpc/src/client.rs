//! Batched JSON-RPC client for a single Ethereum endpoint.
//!
//! This module provides [`RpcClient`], the crate's main entry point.
//!
//! # Features
//!
//! - **Call coalescing**: concurrent [`call`](RpcClient::call)s within a ~1 ms
//!   window are flushed as one JSON array request
//! - **Adaptive batch sizing**: probes the endpoint's batch ceiling upward
//!   from 1 and freezes on the first rejection
//! - **Retry discipline**: 429/Retry-After, exponential slot backoff, and a
//!   wall-clock deadline racing the whole attempt sequence
//!
//! # Example
//!
//! ```ignore
//! use eth_rpc::RpcClient;
//!
//! let client = RpcClient::new("https://eth.example.org/rpc")?;
//!
//! // Concurrent calls coalesce into one wire request.
//! let (number, chain_id) = tokio::join!(
//!     client.call("eth_blockNumber", serde_json::json!([])),
//!     client.call("eth_chainId", serde_json::json!([])),
//! );
//! ```

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::batch::{
    BatchOutcome, BatchSizing, PendingCall, SharedSizing, execute_batch, execute_single,
    run_scheduler, with_sizing,
};
use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::transport::HttpTransport;
use crate::types::{JsonRpcRequest, RequestOptions};

// ═══════════════════════════════════════════════════════════════════════════════
// RPC CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Batched JSON-RPC client bound to one endpoint.
///
/// # Thread Safety
///
/// The client is `Send + Sync` and intended to be shared behind an [`Arc`].
/// Every concurrent caller feeds the same scheduler, which is what makes the
/// coalescing worthwhile.
///
/// # Runtime
///
/// Construction spawns the scheduler task and therefore must happen inside a
/// Tokio runtime.
#[derive(Debug)]
pub struct RpcClient {
    /// Queue into the scheduler task.
    queue: mpsc::UnboundedSender<PendingCall>,
    /// Transport shared with the scheduler for direct (non-coalesced) calls.
    transport: Arc<HttpTransport>,
    /// Adaptive batch-size state shared with the scheduler.
    sizing: SharedSizing,
    /// Request ID counter for JSON-RPC correlation.
    request_id: AtomicU64,
}

impl RpcClient {
    /// Create a new client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_config(url, ClientConfig::default())
    }

    /// Create a new client with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be created.
    pub fn with_config(url: impl Into<String>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(HttpTransport::new(url, config.clone())?);
        let sizing: SharedSizing = Arc::new(Mutex::new(BatchSizing::new(config.max_batch_size)));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_scheduler(
            rx,
            Arc::clone(&transport),
            Arc::clone(&sizing),
            config.batch_window,
        ));

        Ok(Self {
            queue: tx,
            transport,
            sizing,
            request_id: AtomicU64::new(1),
        })
    }

    /// Endpoint URL this client talks to.
    #[must_use]
    pub fn url(&self) -> &str {
        self.transport.url()
    }

    /// Current adaptive batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        with_sizing(&self.sizing, |s| s.current())
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // CALLS
    // ───────────────────────────────────────────────────────────────────────────

    /// Issue a call through the coalescing scheduler.
    ///
    /// # Errors
    ///
    /// Returns the server's JSON-RPC error, a transport error once retries
    /// are exhausted, or [`RpcError::Closed`] if the scheduler is gone.
    #[instrument(skip(self, params), fields(method))]
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let request = JsonRpcRequest::new(method.to_string(), params, self.next_request_id());
        let (tx, rx) = oneshot::channel();

        self.queue
            .send(PendingCall {
                request,
                respond_to: tx,
            })
            .map_err(|_| RpcError::Closed)?;

        rx.await.map_err(|_| RpcError::Closed)?
    }

    /// Issue a call and deserialize the result.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus [`RpcError::Serialization`] when the
    /// result does not match `T`.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Issue a call outside the scheduler, with per-call options.
    ///
    /// Calls with non-default options (pass-through, processors) cannot share
    /// a wire request with ordinary calls, so they always go out alone.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call).
    #[instrument(skip(self, params, options), fields(method))]
    pub async fn call_with_options(
        &self,
        method: &str,
        params: serde_json::Value,
        options: &RequestOptions,
    ) -> Result<serde_json::Value> {
        let request = JsonRpcRequest::new(method.to_string(), params, self.next_request_id());
        execute_single(&self.transport, &request, options).await
    }

    /// Issue an explicit batch, preserving request order in the results.
    ///
    /// The batch is chunked to the current adaptive size, so a fresh client
    /// will send singles while it probes upward. A chunk whose array shape is
    /// rejected is replayed as single requests.
    ///
    /// # Errors
    ///
    /// Returns the first per-request error encountered, or a transport error
    /// for a whole chunk.
    #[instrument(skip(self, calls), fields(count = calls.len()))]
    pub async fn batch_call(
        &self,
        calls: Vec<(String, serde_json::Value)>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut out = Vec::with_capacity(calls.len());
        let mut index = 0;

        while index < calls.len() {
            let size = with_sizing(&self.sizing, |s| s.current()).max(1);
            let end = (index + size).min(calls.len());
            let requests: Vec<JsonRpcRequest> = calls[index..end]
                .iter()
                .map(|(method, params)| {
                    JsonRpcRequest::new(method.clone(), params.clone(), self.next_request_id())
                })
                .collect();

            match execute_batch(&self.transport, &self.sizing, &requests).await? {
                BatchOutcome::Results(results) => {
                    for result in results {
                        out.push(result?);
                    }
                }
                BatchOutcome::ShapeRejected => {
                    for request in &requests {
                        out.push(
                            execute_single(&self.transport, request, &RequestOptions::default())
                                .await?,
                        );
                    }
                }
            }

            index = end;
        }

        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
