//! Dispatcher workers: fetch, process, report.
//!
//! Workers pull heights from the dispatcher queue, assemble the block
//! (dictionary payload when present, chain fetch otherwise), run the
//! handler set through the [`BlockConsumer`] boundary, and report a
//! [`WorkerResult`] to the committer. Everything in the result is an owned
//! value; the worker boundary passes values, never handles.
//!
//! Transient fetch failures retry with a short backoff. A failure that
//! survives the retries is reported as fatal: the commit loop may never
//! skip a height.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use chain_api::types::FetchedBlock;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{IndexerError, Result};
use crate::indexer::dispatcher::DispatcherShared;
use crate::ports::{BlockConsumer, BlockLoader};
use crate::types::{DataSource, DataSourceMap};

/// Delay between worker fetch retries.
const RETRY_DELAY: Duration = Duration::from_millis(500);

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER MESSAGES
// ═══════════════════════════════════════════════════════════════════════════════

/// A successfully processed block, as reported to the committer.
#[derive(Debug, Clone)]
pub(crate) struct ProcessedBlock {
    /// Block height.
    pub height: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent hash, for reorg bookkeeping.
    pub parent_hash: B256,
    /// Data sources created by handlers during this block.
    pub dynamic_data_sources: Vec<DataSource>,
}

/// One worker report.
#[derive(Debug)]
pub(crate) struct WorkerResult {
    /// Height the worker handled.
    pub height: u64,
    /// Flush epoch observed when the height was dequeued; results from
    /// before a flush are stale and discarded by the committer.
    pub epoch: u64,
    /// The processed block, or the fatal error.
    pub outcome: Result<ProcessedBlock>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER LOOP
// ═══════════════════════════════════════════════════════════════════════════════

/// Run one worker until shutdown or the committer goes away.
pub(crate) async fn run_worker(
    worker_id: usize,
    shared: Arc<DispatcherShared>,
    loader: Arc<dyn BlockLoader>,
    consumer: Arc<dyn BlockConsumer>,
    data_sources: Arc<RwLock<DataSourceMap>>,
    results: mpsc::Sender<WorkerResult>,
    retries: u32,
) {
    debug!(worker_id, "worker started");

    loop {
        let Some((height, epoch)) = shared.next_height().await else {
            debug!(worker_id, "worker stopping");
            return;
        };

        trace!(worker_id, height, "processing block");
        let outcome = process_one(&shared, &loader, &consumer, &data_sources, height, retries).await;

        if results
            .send(WorkerResult {
                height,
                epoch,
                outcome,
            })
            .await
            .is_err()
        {
            // Committer is gone; nothing left to report to.
            return;
        }
    }
}

/// Assemble and process one block.
async fn process_one(
    shared: &DispatcherShared,
    loader: &Arc<dyn BlockLoader>,
    consumer: &Arc<dyn BlockConsumer>,
    data_sources: &Arc<RwLock<DataSourceMap>>,
    height: u64,
    retries: u32,
) -> Result<ProcessedBlock> {
    let block = fetch_with_retries(shared, loader, height, retries).await?;
    let active: Vec<DataSource> = data_sources.read().at(height).to_vec();

    let outcome = consumer
        .process_block(&block, &active)
        .await
        .map_err(|e| IndexerError::HandlerFailure {
            height,
            reason: e.to_string(),
        })?;

    Ok(ProcessedBlock {
        height,
        hash: block.hash(),
        parent_hash: outcome.parent_hash,
        dynamic_data_sources: outcome.dynamic_data_sources,
    })
}

/// Dictionary payload when present, chain fetch with retries otherwise.
async fn fetch_with_retries(
    shared: &DispatcherShared,
    loader: &Arc<dyn BlockLoader>,
    height: u64,
    retries: u32,
) -> Result<FetchedBlock> {
    if let Some(payload) = shared.take_payload(height) {
        trace!(height, "using dictionary payload");
        return Ok(payload);
    }

    let mut attempt = 0;
    loop {
        match loader.load_block(height).await {
            Ok(block) => return Ok(block),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(height, attempt, error = %e, "block fetch failed, retrying");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    // Worker behavior is exercised end-to-end through the dispatcher tests;
    // only the retry helper is worth pinning in isolation.

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chain_api::types::BlockHeader;

    use super::*;
    use crate::indexer::dispatcher::DispatcherShared;

    fn block(height: u64) -> FetchedBlock {
        FetchedBlock {
            header: BlockHeader {
                number: height,
                hash: B256::from([height as u8; 32]),
                parent_hash: B256::from([height.saturating_sub(1) as u8; 32]),
                timestamp: 0,
                state_root: B256::ZERO,
                logs_bloom: Default::default(),
                gas_limit: 0,
                gas_used: 0,
                base_fee_per_gas: None,
            },
            transactions: vec![],
            logs: vec![],
        }
    }

    #[derive(Debug, Default)]
    struct FlakyLoader {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl BlockLoader for FlakyLoader {
        async fn load_block(&self, height: u64) -> Result<FetchedBlock> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(IndexerError::Store("transient".into()));
            }
            Ok(block(height))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_retries_then_succeeds() {
        let shared = DispatcherShared::for_tests(8);
        let loader: Arc<dyn BlockLoader> = Arc::new(FlakyLoader {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });

        let block = fetch_with_retries(&shared, &loader, 7, 3).await.expect("block");
        assert_eq!(block.height(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_exhausts_retries() {
        let shared = DispatcherShared::for_tests(8);
        let loader: Arc<dyn BlockLoader> = Arc::new(FlakyLoader {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });

        let result = fetch_with_retries(&shared, &loader, 7, 2).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn payload_bypasses_loader() {
        let shared = DispatcherShared::for_tests(8);
        shared.insert_payload(9, block(9));

        // A loader that always fails proves the payload path never fetches.
        let loader: Arc<dyn BlockLoader> = Arc::new(FlakyLoader {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });

        let block = fetch_with_retries(&shared, &loader, 9, 0).await.expect("block");
        assert_eq!(block.height(), 9);
    }
}
