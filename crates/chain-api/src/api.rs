//! Ethereum-semantics facade over the connection pool.
//!
//! [`ChainApi`] is what the indexing core talks to: heights, blocks, logs,
//! receipts. It hides endpoint selection, failover, and the pre-merge
//! finalization fallback.
//!
//! # Finalization
//!
//! The facade prefers the `finalized` tag and falls back to `safe`. An
//! endpoint that rejects both (pre-merge chain) flips a cached feature flag,
//! and from then on finality is approximated as `best − 15` without asking
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy::primitives::B256;
use tracing::{debug, info, instrument};

use crate::connection::{Connection, parse_hex_u64};
use crate::error::{ChainApiError, Result};
use crate::pool::ConnectionPool;
use crate::types::{BlockRef, EthBlock, FetchedBlock, LogRecord, TransactionReceipt, TransactionRecord};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Depth subtracted from the best height when the chain has no finality tag.
///
/// 15 blocks is deep enough that a competing fork has effectively zero
/// probability on proof-of-work Ethereum-family chains.
pub const FINALIZED_FALLBACK_DEPTH: u64 = 15;

/// Finality tags tried in order before falling back.
const FINALITY_TAGS: [&str; 2] = ["finalized", "safe"];

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN API
// ═══════════════════════════════════════════════════════════════════════════════

/// High-level chain access for the indexing core.
#[derive(Debug)]
pub struct ChainApi {
    /// Pool of verified endpoints.
    pool: Arc<ConnectionPool>,
    /// Whether the chain honors finality tags. Starts optimistic; cleared
    /// permanently on the first rejection.
    supports_finality_tag: AtomicBool,
}

impl ChainApi {
    /// Wrap a connected pool.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            supports_finality_tag: AtomicBool::new(true),
        }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Whether the finality-tag feature is still believed available.
    #[must_use]
    pub fn finality_tag_supported(&self) -> bool {
        self.supports_finality_tag.load(Ordering::Acquire)
    }

    /// Run one call against the current connection, reporting failures.
    async fn with_connection<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let connection = self.pool.api()?;
        let result = f(Arc::clone(&connection)).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                self.pool.report_unhealthy(&connection);
            }
        }
        result
    }

    // ───────────────────────────────────────────────────────────────────────────
    // HEIGHTS
    // ───────────────────────────────────────────────────────────────────────────

    /// Height of the chain head.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error.
    pub async fn get_best_block_height(&self) -> Result<u64> {
        self.with_connection(|connection| async move {
            let raw: String = connection
                .client()
                .call_as("eth_blockNumber", serde_json::json!([]))
                .await?;
            parse_hex_u64(&raw)
        })
        .await
    }

    /// Height of the finalized tip.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error.
    #[instrument(skip(self))]
    pub async fn get_finalized_block_height(&self) -> Result<u64> {
        if self.supports_finality_tag.load(Ordering::Acquire) {
            for tag in FINALITY_TAGS {
                match self.block_number_for_tag(tag).await {
                    Ok(height) => return Ok(height),
                    Err(ChainApiError::Rpc(e)) if is_tag_rejection(&e) => {
                        debug!(tag, "finality tag rejected");
                    }
                    Err(e) => return Err(e),
                }
            }

            // Pre-merge chain: remember and never ask again.
            self.supports_finality_tag.store(false, Ordering::Release);
            info!(
                depth = FINALIZED_FALLBACK_DEPTH,
                "finality tags unsupported, falling back to depth approximation"
            );
        }

        let best = self.get_best_block_height().await?;
        Ok(best.saturating_sub(FINALIZED_FALLBACK_DEPTH))
    }

    async fn block_number_for_tag(&self, tag: &str) -> Result<u64> {
        self.with_connection(|connection| async move {
            let value = connection
                .client()
                .call("eth_getBlockByNumber", serde_json::json!([tag, false]))
                .await?;
            if value.is_null() {
                return Err(ChainApiError::InvalidResponse(format!(
                    "null block for tag {tag:?}"
                )));
            }
            let raw = value
                .get("number")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| {
                    ChainApiError::InvalidResponse(format!("block for tag {tag:?} without number"))
                })?;
            parse_hex_u64(raw)
        })
        .await
    }

    // ───────────────────────────────────────────────────────────────────────────
    // BLOCKS, LOGS, RECEIPTS
    // ───────────────────────────────────────────────────────────────────────────

    /// Fetch a block (hashes-only transaction list) by height or hash.
    ///
    /// # Errors
    ///
    /// [`ChainApiError::MissingBlock`] for unknown heights; unknown hashes
    /// surface as [`ChainApiError::InvalidResponse`].
    pub async fn get_block_by_height_or_hash(&self, block: impl Into<BlockRef>) -> Result<EthBlock> {
        let block = block.into();
        self.with_connection(|connection| async move {
            let value = match block {
                BlockRef::Height(height) => {
                    let tag = format!("0x{height:x}");
                    connection
                        .client()
                        .call("eth_getBlockByNumber", serde_json::json!([tag, false]))
                        .await?
                }
                BlockRef::Hash(hash) => {
                    connection
                        .client()
                        .call(
                            "eth_getBlockByHash",
                            serde_json::json!([format!("{hash}"), false]),
                        )
                        .await?
                }
            };

            if value.is_null() {
                return match block {
                    BlockRef::Height(height) => Err(ChainApiError::MissingBlock(height)),
                    BlockRef::Hash(hash) => Err(ChainApiError::InvalidResponse(format!(
                        "no block with hash {hash}"
                    ))),
                };
            }

            Ok(serde_json::from_value(value)?)
        })
        .await
    }

    /// Logs for an inclusive height range.
    ///
    /// # Errors
    ///
    /// Returns the underlying RPC error.
    pub async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<LogRecord>> {
        self.with_connection(|connection| async move {
            let value = connection
                .client()
                .call(
                    "eth_getLogs",
                    serde_json::json!([{
                        "fromBlock": format!("0x{from:x}"),
                        "toBlock": format!("0x{to:x}"),
                    }]),
                )
                .await?;
            Ok(serde_json::from_value(value)?)
        })
        .await
    }

    /// Receipt for a transaction.
    ///
    /// # Errors
    ///
    /// [`ChainApiError::InvalidResponse`] when the endpoint does not know the
    /// transaction.
    pub async fn get_transaction_receipt(&self, hash: B256) -> Result<TransactionReceipt> {
        self.with_connection(|connection| async move {
            let value = connection
                .client()
                .call(
                    "eth_getTransactionReceipt",
                    serde_json::json!([format!("{hash}")]),
                )
                .await?;
            if value.is_null() {
                return Err(ChainApiError::InvalidResponse(format!(
                    "no receipt for transaction {hash}"
                )));
            }
            Ok(serde_json::from_value(value)?)
        })
        .await
    }

    /// Resolve a transaction's receipt through its one-shot memo.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; the memo stays empty for a later retry.
    pub async fn resolve_receipt<'tx>(
        &self,
        transaction: &'tx TransactionRecord,
    ) -> Result<&'tx TransactionReceipt> {
        transaction
            .receipt(|hash| self.get_transaction_receipt(hash))
            .await
    }

    /// Fetch a fully assembled block, walking the pool on failure.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::fetch_blocks_from_first_available`].
    pub async fn fetch_block(&self, height: u64, include_tx: bool) -> Result<FetchedBlock> {
        let mut blocks = self
            .pool
            .fetch_blocks_from_first_available(&[height], include_tx)
            .await?;
        blocks
            .pop()
            .ok_or(ChainApiError::MissingBlock(height))
    }

    /// Fetch several fully assembled blocks.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::fetch_blocks_from_first_available`].
    pub async fn fetch_blocks(&self, heights: &[u64], include_tx: bool) -> Result<Vec<FetchedBlock>> {
        self.pool
            .fetch_blocks_from_first_available(heights, include_tx)
            .await
    }
}

/// Whether an RPC error means "this tag does not exist here".
fn is_tag_rejection(error: &eth_rpc::RpcError) -> bool {
    match error {
        eth_rpc::RpcError::MethodNotSupported { .. } => true,
        eth_rpc::RpcError::Rpc { code, .. } => {
            // -32602 invalid params is the usual pre-merge answer
            *code == -32602 || *code == -32601 || *code == -32600
        }
        _ => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
