//! Batch scheduling and adaptive batch sizing.
//!
//! Concurrent calls made through [`RpcClient::call`](crate::RpcClient::call)
//! land in a queue owned by a scheduler task. The scheduler collects calls
//! arriving within the coalescing window (or until the current batch size is
//! reached) and flushes them as one JSON array request.
//!
//! # Adaptive sizing
//!
//! Providers cap batch sizes at wildly different values and report the
//! overflow in incompatible ways. Instead of special-casing providers, the
//! client probes:
//!
//! - start at 1, increment after every successful batch ("testing")
//! - on the first transport error, non-array response, or length mismatch,
//!   decrement once and freeze ("determined")
//! - probing also stops at the configured ceiling
//!
//! Calls caught in a rejected batch are replayed as single requests so the
//! probe never costs callers a spurious failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Result, RpcError};
use crate::transport::HttpTransport;
use crate::types::{JsonRpcRequest, JsonRpcResponse, RequestOptions};

// ═══════════════════════════════════════════════════════════════════════════════
// BATCH SIZING
// ═══════════════════════════════════════════════════════════════════════════════

/// Probing phase of the adaptive batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SizingPhase {
    /// Still probing upward.
    Testing,
    /// Frozen; the endpoint's ceiling (or the configured cap) was found.
    Determined,
}

/// Adaptive batch-size state machine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchSizing {
    size: usize,
    phase: SizingPhase,
    max: usize,
}

impl BatchSizing {
    pub(crate) const fn new(max: usize) -> Self {
        Self {
            size: 1,
            phase: SizingPhase::Testing,
            max,
        }
    }

    /// Current batch size to aim for.
    pub(crate) const fn current(&self) -> usize {
        self.size
    }

    pub(crate) const fn phase(&self) -> SizingPhase {
        self.phase
    }

    /// A batch of the current size succeeded.
    pub(crate) const fn record_success(&mut self) {
        if matches!(self.phase, SizingPhase::Testing) {
            if self.size < self.max {
                self.size += 1;
            } else {
                self.phase = SizingPhase::Determined;
            }
        }
    }

    /// A batch was rejected (error, non-array, or length mismatch).
    pub(crate) const fn record_failure(&mut self) {
        if self.size > 1 {
            self.size -= 1;
        }
        self.phase = SizingPhase::Determined;
    }
}

/// Sizing state shared between the scheduler task and explicit batch calls.
pub(crate) type SharedSizing = Arc<Mutex<BatchSizing>>;

pub(crate) fn with_sizing<R>(sizing: &SharedSizing, f: impl FnOnce(&mut BatchSizing) -> R) -> R {
    let mut guard = sizing.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PENDING CALLS & SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════════

/// A call waiting in the scheduler queue.
pub(crate) struct PendingCall {
    pub(crate) request: JsonRpcRequest,
    pub(crate) respond_to: oneshot::Sender<Result<serde_json::Value>>,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("method", &self.request.method)
            .field("id", &self.request.id)
            .finish()
    }
}

/// Scheduler task body: collect, coalesce, dispatch.
///
/// Runs until every sender handle is dropped. Each flush is dispatched on its
/// own task so a slow batch never blocks coalescing of the next one.
pub(crate) async fn run_scheduler(
    mut rx: mpsc::UnboundedReceiver<PendingCall>,
    transport: Arc<HttpTransport>,
    sizing: SharedSizing,
    window: std::time::Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let target = with_sizing(&sizing, |s| s.current());

        if batch.len() < target {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    next = rx.recv() => match next {
                        Some(call) => {
                            batch.push(call);
                            if batch.len() >= target {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }

        trace!(size = batch.len(), target, "flushing batch");
        let transport = Arc::clone(&transport);
        let sizing = Arc::clone(&sizing);
        tokio::spawn(dispatch(transport, sizing, batch));
    }
}

/// Dispatch one flushed batch and distribute results.
///
/// Flushes always go out as JSON arrays, even with one element; the probe
/// depends on array responses, and JSON-RPC servers answer arrays in kind.
async fn dispatch(transport: Arc<HttpTransport>, sizing: SharedSizing, batch: Vec<PendingCall>) {
    let requests: Vec<JsonRpcRequest> = batch.iter().map(|c| c.request.clone()).collect();

    match execute_batch(&transport, &sizing, &requests).await {
        Ok(BatchOutcome::Results(results)) => {
            for (call, result) in batch.into_iter().zip(results) {
                let _ = call.respond_to.send(result);
            }
        }
        Ok(BatchOutcome::ShapeRejected) => {
            // The probe found the ceiling. Replay each call on its own so the
            // probe stays invisible to callers.
            debug!(replayed = batch.len(), "batch rejected, replaying as singles");
            for call in batch {
                let result =
                    execute_single(&transport, &call.request, &RequestOptions::default()).await;
                let _ = call.respond_to.send(result);
            }
        }
        Err(error) => {
            for call in batch {
                let _ = call.respond_to.send(Err(replicate(&error)));
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXECUTION HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of an attempted array request.
#[derive(Debug)]
pub(crate) enum BatchOutcome {
    /// Per-request results aligned with the input order.
    Results(Vec<Result<serde_json::Value>>),
    /// The response shape was rejected; the caller should fall back to
    /// single requests. Sizing has already been downgraded.
    ShapeRejected,
}

/// Execute a single JSON-RPC request and extract its result.
pub(crate) async fn execute_single(
    transport: &HttpTransport,
    request: &JsonRpcRequest,
    options: &RequestOptions,
) -> Result<serde_json::Value> {
    let payload = serde_json::to_value(request)?;
    let body = transport.send(Some(&payload), options).await?;
    extract_result(body, &request.method, options.error_pass_through)
}

/// Execute a JSON array request (any length ≥ 1).
///
/// Returns [`BatchOutcome::ShapeRejected`] (after downgrading the sizing)
/// when the response is not an array of matching length.
pub(crate) async fn execute_batch(
    transport: &HttpTransport,
    sizing: &SharedSizing,
    requests: &[JsonRpcRequest],
) -> Result<BatchOutcome> {
    let payload = serde_json::to_value(requests)?;
    let body = transport.send(Some(&payload), &RequestOptions::default()).await?;

    let Some(items) = body.as_array() else {
        warn!(
            sent = requests.len(),
            "non-array batch response, freezing batch size"
        );
        with_sizing(sizing, BatchSizing::record_failure);
        return Ok(BatchOutcome::ShapeRejected);
    };

    if items.len() != requests.len() {
        warn!(
            sent = requests.len(),
            got = items.len(),
            "batch length mismatch, freezing batch size"
        );
        with_sizing(sizing, BatchSizing::record_failure);
        return Ok(BatchOutcome::ShapeRejected);
    }

    with_sizing(sizing, BatchSizing::record_success);

    // Servers may reorder array responses; correlate by id.
    let mut by_id: HashMap<u64, &serde_json::Value> = HashMap::with_capacity(items.len());
    for item in items {
        if let Some(id) = item.get("id").and_then(serde_json::Value::as_u64) {
            by_id.insert(id, item);
        }
    }

    let results = requests
        .iter()
        .map(|request| {
            by_id.get(&request.id).map_or_else(
                || {
                    Err(RpcError::InvalidResponse(format!(
                        "no batch response for id {}",
                        request.id
                    )))
                },
                |value| extract_result((*value).clone(), &request.method, false),
            )
        })
        .collect();

    Ok(BatchOutcome::Results(results))
}

/// Pull the result out of a response envelope.
fn extract_result(
    body: serde_json::Value,
    method: &str,
    pass_through: bool,
) -> Result<serde_json::Value> {
    match serde_json::from_value::<JsonRpcResponse>(body.clone()) {
        Ok(envelope) => {
            if let Some(error) = envelope.error {
                return Err(error.into_error(method));
            }
            if let Some(result) = envelope.result {
                return Ok(result);
            }
            if pass_through {
                // Pass-through bodies are not required to be envelopes.
                Ok(body)
            } else {
                Err(RpcError::InvalidResponse(format!(
                    "{method}: response carries neither result nor error"
                )))
            }
        }
        Err(_) if pass_through => Ok(body),
        Err(e) => Err(RpcError::InvalidResponse(format!("{method}: {e}"))),
    }
}

/// Reconstruct an error for fan-out to multiple waiting callers.
///
/// [`RpcError`] holds non-clonable sources; every variant that matters here
/// rebuilds losslessly, and the serialization case degrades to its message.
fn replicate(error: &RpcError) -> RpcError {
    match error {
        RpcError::Connection(s) => RpcError::Connection(s.clone()),
        RpcError::Timeout(d) => RpcError::Timeout(*d),
        RpcError::ServerError(s) => RpcError::ServerError(s.clone()),
        RpcError::Http { status, body } => RpcError::Http {
            status: *status,
            body: body.clone(),
        },
        RpcError::ThrottleExhausted { attempts } => RpcError::ThrottleExhausted {
            attempts: *attempts,
        },
        RpcError::Rpc {
            code,
            message,
            data,
        } => RpcError::Rpc {
            code: *code,
            message: message.clone(),
            data: data.clone(),
        },
        RpcError::MethodNotSupported { method } => RpcError::MethodNotSupported {
            method: method.clone(),
        },
        RpcError::BatchShapeMismatch { sent, got } => RpcError::BatchShapeMismatch {
            sent: *sent,
            got: got.clone(),
        },
        RpcError::InvalidResponse(s) => RpcError::InvalidResponse(s.clone()),
        RpcError::InvalidConfig(s) => RpcError::InvalidConfig(s.clone()),
        RpcError::Closed => RpcError::Closed,
        other => RpcError::ServerError(other.to_string()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
