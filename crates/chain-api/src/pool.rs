//! Connection pool over several JSON-RPC endpoints.
//!
//! The pool owns an ordered set of [`Connection`]s, routes each call to the
//! next healthy one round-robin, and walks the set on failure.
//!
//! # Health protocol
//!
//! A connection observed failing in a retryable way is marked unhealthy and
//! handed to a background reconnect task that probes it with exponential
//! backoff, up to a small attempt ceiling. Non-retryable failures (a wrong
//! answer rather than no answer) are surfaced to the caller untouched.
//!
//! # Chain identity
//!
//! Every endpoint must report the same `{chainId, genesisHash, runtimeChain}`
//! as the first-joined one. A mismatch is a configuration error and fatal at
//! init, before any block is fetched.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use eth_rpc::ClientConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::Connection;
use crate::error::{ChainApiError, Result};
use crate::types::{ChainIdentity, FetchedBlock};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Endpoints walked before a pooled fetch gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Background reconnect probes before a connection is left for dead.
const RECONNECT_ATTEMPT_CEILING: u32 = 5;

/// Base delay for reconnect backoff (doubles per attempt).
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════════════════════
// CONNECTION POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Pool of verified connections to one chain.
///
/// The set of connections is fixed at construction; only health flags change
/// afterwards, so lookups are lock-free.
#[derive(Debug)]
pub struct ConnectionPool {
    /// All connections, healthy or not, in join order.
    connections: Vec<Arc<Connection>>,
    /// Round-robin cursor.
    cursor: AtomicUsize,
}

impl ConnectionPool {
    /// Connect to every endpoint and verify chain identity across them.
    ///
    /// # Errors
    ///
    /// - Any endpoint failing to connect fails construction (a misconfigured
    ///   pool should not limp)
    /// - [`ChainApiError::ChainMismatch`] when an endpoint disagrees with the
    ///   first-joined one on chainId, genesisHash, or runtimeChain
    #[instrument(skip_all, fields(endpoints = endpoints.len()))]
    pub async fn connect(endpoints: Vec<String>, config: ClientConfig) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ChainApiError::InvalidConfig(
                "at least one network endpoint is required".into(),
            ));
        }

        let mut connections: Vec<Arc<Connection>> = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let connection = Connection::connect(endpoint, config.clone()).await?;

            if let Some(first) = connections.first() {
                verify_identity(first.identity(), &connection)?;
            }

            connections.push(Arc::new(connection));
        }

        info!(
            connections = connections.len(),
            chain_id = connections
                .first()
                .map_or(0, |c| c.identity().chain_id),
            "connection pool ready"
        );

        Ok(Self {
            connections,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Build a pool from pre-connected connections (tests, custom wiring).
    ///
    /// # Errors
    ///
    /// Same identity verification as [`connect`](Self::connect).
    pub fn from_connections(connections: Vec<Connection>) -> Result<Self> {
        if connections.is_empty() {
            return Err(ChainApiError::InvalidConfig(
                "at least one connection is required".into(),
            ));
        }

        let mut verified: Vec<Arc<Connection>> = Vec::with_capacity(connections.len());
        for connection in connections {
            if let Some(first) = verified.first() {
                verify_identity(first.identity(), &connection)?;
            }
            verified.push(Arc::new(connection));
        }

        Ok(Self {
            connections: verified,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Identity of the chain this pool serves.
    ///
    /// # Panics
    ///
    /// Never: construction rejects empty pools.
    #[must_use]
    pub fn identity(&self) -> &ChainIdentity {
        // Non-empty by construction
        #[allow(clippy::expect_used)]
        self.connections
            .first()
            .expect("pool is never empty")
            .identity()
    }

    /// Total number of endpoints (healthy or not).
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of currently healthy endpoints.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_healthy()).count()
    }

    /// Next healthy connection, round-robin.
    ///
    /// # Errors
    ///
    /// [`ChainApiError::NoHealthyEndpoints`] when every connection is down.
    pub fn api(&self) -> Result<Arc<Connection>> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let n = self.connections.len();

        for offset in 0..n {
            let connection = &self.connections[(start + offset) % n];
            if connection.is_healthy() {
                return Ok(Arc::clone(connection));
            }
        }

        Err(ChainApiError::NoHealthyEndpoints)
    }

    /// Report a connection as failed.
    ///
    /// Marks it unhealthy and schedules background reconnection. Safe to call
    /// repeatedly; only the transition from healthy schedules a probe.
    pub fn report_unhealthy(&self, connection: &Arc<Connection>) {
        if !connection.is_healthy() {
            return;
        }
        connection.set_healthy(false);
        warn!(endpoint = connection.endpoint(), "connection marked unhealthy");

        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            reconnect_with_backoff(connection).await;
        });
    }

    /// Fetch fully assembled blocks, walking the pool on failure.
    ///
    /// Retryable failures mark the connection unhealthy and move on to the
    /// next endpoint, up to [`MAX_RECONNECT_ATTEMPTS`] before surfacing.
    ///
    /// # Errors
    ///
    /// The first non-retryable error, or [`ChainApiError::AllEndpointsFailed`].
    #[instrument(skip(self, heights), fields(count = heights.len()))]
    pub async fn fetch_blocks_from_first_available(
        &self,
        heights: &[u64],
        include_tx: bool,
    ) -> Result<Vec<FetchedBlock>> {
        let mut last_error = String::from("no attempt made");

        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let connection = self.api()?;

            match connection.fetch_blocks(heights, include_tx).await {
                Ok(blocks) => return Ok(blocks),
                Err(e) if e.is_retryable() => {
                    debug!(
                        attempt,
                        endpoint = connection.endpoint(),
                        error = %e,
                        "fetch failed, walking pool"
                    );
                    last_error = e.to_string();
                    self.report_unhealthy(&connection);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ChainApiError::AllEndpointsFailed {
            attempts: MAX_RECONNECT_ATTEMPTS,
            last_error,
        })
    }
}

/// Compare an incoming connection's identity against the pool's.
fn verify_identity(expected: &ChainIdentity, connection: &Connection) -> Result<()> {
    let got = connection.identity();

    if got.chain_id != expected.chain_id {
        return Err(ChainApiError::ChainMismatch {
            endpoint: connection.endpoint().to_string(),
            field: "chainId",
            expected: expected.chain_id.to_string(),
            got: got.chain_id.to_string(),
        });
    }

    if got.genesis_hash != expected.genesis_hash {
        return Err(ChainApiError::ChainMismatch {
            endpoint: connection.endpoint().to_string(),
            field: "genesisHash",
            expected: expected.genesis_hash.to_string(),
            got: got.genesis_hash.to_string(),
        });
    }

    // Only comparable when both endpoints expose a client version.
    if expected.runtime_known() && got.runtime_known() && got.runtime_chain != expected.runtime_chain
    {
        return Err(ChainApiError::ChainMismatch {
            endpoint: connection.endpoint().to_string(),
            field: "runtimeChain",
            expected: expected.runtime_chain.clone(),
            got: got.runtime_chain.clone(),
        });
    }

    Ok(())
}

/// Probe a dead connection with exponential backoff.
async fn reconnect_with_backoff(connection: Arc<Connection>) {
    for attempt in 0..RECONNECT_ATTEMPT_CEILING {
        let delay = RECONNECT_BASE_DELAY * 2u32.saturating_pow(attempt);
        tokio::time::sleep(delay).await;

        match connection.reconnect().await {
            Ok(()) => {
                info!(
                    endpoint = connection.endpoint(),
                    attempt, "connection restored"
                );
                return;
            }
            Err(e) => {
                debug!(
                    endpoint = connection.endpoint(),
                    attempt,
                    error = %e,
                    "reconnect probe failed"
                );
            }
        }
    }

    error!(
        endpoint = connection.endpoint(),
        attempts = RECONNECT_ATTEMPT_CEILING,
        "giving up on connection"
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
