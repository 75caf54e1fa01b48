//! Block dispatcher: bounded queue, worker pool, in-order commit.
//!
//! The dispatcher sits between the fetch service and the handler workers:
//!
//! ```text
//! fetcher ──enqueue_blocks──▶ queue ──▶ workers (parallel) ──▶ committer
//!    ▲                                                            │
//!    └────── Rewind / NewDataSources events ◀─────────────────────┘
//! ```
//!
//! Heights enter strictly increasing and *commits* complete strictly
//! increasing: workers run in parallel, but a completed block waits in the
//! committer's reorder buffer until its predecessor has committed. Each
//! commit registers the block with the unfinalized tracker and persists the
//! new `lastProcessedHeight` in the same store transaction.
//!
//! On a detected fork the committer flushes the queue, issues the reindex
//! inside the same transaction, and emits a rewind event for the fetcher.
//!
//! Backpressure is `free_size`-based: enqueueing more than the free
//! capacity is a caller bug, not a blocking operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chain_api::types::FetchedBlock;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{IndexerError, Result};
use crate::indexer::unfinalized::UnfinalizedBlocks;
use crate::indexer::worker::{ProcessedBlock, WorkerResult, run_worker};
use crate::ports::{BlockConsumer, BlockLoader, MetadataStore, keys};
use crate::types::{DataSource, DataSourceMap};

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG & EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Fetch batch size; the queue holds twice this.
    pub batch_size: usize,
    /// Parallel workers (default: endpoints × 2).
    pub worker_count: usize,
    /// Internal fetch retries before a worker failure turns fatal.
    pub worker_retries: u32,
}

impl DispatcherConfig {
    /// Queue capacity derived from the batch size.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.batch_size * 2
    }
}

/// Events the dispatcher reports to the fetch service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherEvent {
    /// A fork was handled; the cursor must rewind to `height + 1`.
    Rewind(u64),
    /// Handlers created data sources while committing `height`; the fetcher
    /// must reset for them.
    NewDataSources {
        /// Height of the creating block (already committed).
        height: u64,
        /// The data sources that were created.
        sources: Vec<DataSource>,
    },
}

/// What the fetch service needs from the dispatcher.
pub trait BlockSink: Send + Sync {
    /// Remaining queue capacity.
    fn free_size(&self) -> usize;

    /// Enqueue heights (non-blocking) and advance the buffered watermark.
    ///
    /// # Errors
    ///
    /// [`IndexerError::InvariantViolation`] when `heights` exceeds
    /// [`free_size`](Self::free_size).
    fn enqueue_blocks(
        &self,
        heights: Vec<u64>,
        last_buffered: u64,
        payloads: HashMap<u64, FetchedBlock>,
    ) -> Result<()>;

    /// Drain pending work above `height` (rewinds and data-source resets).
    fn flush_queue(&self, height: u64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// State shared between the dispatcher handle, its workers, and the
/// committer.
#[derive(Debug)]
pub(crate) struct DispatcherShared {
    /// Pending heights, ascending.
    queue: Mutex<VecDeque<u64>>,
    /// Dictionary-provided payloads keyed by height.
    payloads: Mutex<HashMap<u64, FetchedBlock>>,
    /// Queue capacity.
    capacity: usize,
    /// Heights enqueued but not yet committed or discarded.
    outstanding: AtomicUsize,
    /// Greatest height covered by enqueued batches.
    latest_buffered: AtomicU64,
    /// Flush epoch; results observed under an older epoch are stale.
    epoch: AtomicU64,
    /// Wakes idle workers.
    work_notify: Notify,
    /// Shutdown signal.
    token: CancellationToken,
}

impl DispatcherShared {
    fn new(capacity: usize, token: CancellationToken) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            payloads: Mutex::new(HashMap::new()),
            capacity,
            outstanding: AtomicUsize::new(0),
            latest_buffered: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            work_notify: Notify::new(),
            token,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity, CancellationToken::new()))
    }

    /// Next height to process, with the epoch it was dequeued under.
    /// `None` means shutdown.
    pub(crate) async fn next_height(&self) -> Option<(u64, u64)> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            {
                let mut queue = self.queue.lock();
                if let Some(height) = queue.pop_front() {
                    return Some((height, self.epoch.load(Ordering::Acquire)));
                }
            }
            tokio::select! {
                () = self.work_notify.notified() => {}
                () = self.token.cancelled() => return None,
            }
        }
    }

    /// Remove and return a dictionary payload.
    pub(crate) fn take_payload(&self, height: u64) -> Option<FetchedBlock> {
        self.payloads.lock().remove(&height)
    }

    #[cfg(test)]
    pub(crate) fn insert_payload(&self, height: u64, block: FetchedBlock) {
        self.payloads.lock().insert(height, block);
    }

    /// Release `n` outstanding slots (committed, flushed, or discarded).
    fn release(&self, n: usize) {
        self.outstanding.fetch_sub(n, Ordering::AcqRel);
    }

    fn free(&self) -> usize {
        self.capacity
            .saturating_sub(self.outstanding.load(Ordering::Acquire))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISPATCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to the dispatcher.
pub struct BlockDispatcher {
    shared: Arc<DispatcherShared>,
    config: DispatcherConfig,
    loader: Arc<dyn BlockLoader>,
    consumer: Arc<dyn BlockConsumer>,
    store: Arc<dyn MetadataStore>,
    unfinalized: Arc<UnfinalizedBlocks>,
    data_sources: Arc<RwLock<DataSourceMap>>,
    events: mpsc::UnboundedSender<DispatcherEvent>,
}

impl std::fmt::Debug for BlockDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDispatcher")
            .field("capacity", &self.config.capacity())
            .field("free", &self.shared.free())
            .finish_non_exhaustive()
    }
}

impl BlockDispatcher {
    /// Create a dispatcher.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        loader: Arc<dyn BlockLoader>,
        consumer: Arc<dyn BlockConsumer>,
        store: Arc<dyn MetadataStore>,
        unfinalized: Arc<UnfinalizedBlocks>,
        data_sources: Arc<RwLock<DataSourceMap>>,
        events: mpsc::UnboundedSender<DispatcherEvent>,
        token: CancellationToken,
    ) -> Self {
        let shared = Arc::new(DispatcherShared::new(config.capacity(), token));
        Self {
            shared,
            config,
            loader,
            consumer,
            store,
            unfinalized,
            data_sources,
            events,
        }
    }

    /// Spawn workers and the committer.
    ///
    /// `next_height` is the first height expected to commit (normally
    /// `lastProcessedHeight + 1`). The returned handle resolves with the
    /// committer's verdict; a resolved `Err` is fatal for the process.
    #[must_use]
    pub fn start(&self, next_height: u64) -> JoinHandle<Result<()>> {
        let (results_tx, results_rx) = mpsc::channel(self.config.capacity().max(1));

        for worker_id in 0..self.config.worker_count.max(1) {
            tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self.shared),
                Arc::clone(&self.loader),
                Arc::clone(&self.consumer),
                Arc::clone(&self.data_sources),
                results_tx.clone(),
                self.config.worker_retries,
            ));
        }
        drop(results_tx);

        info!(
            workers = self.config.worker_count.max(1),
            capacity = self.config.capacity(),
            next_height,
            "dispatcher started"
        );

        tokio::spawn(run_committer(
            Arc::clone(&self.shared),
            Arc::clone(&self.store),
            Arc::clone(&self.unfinalized),
            self.events.clone(),
            results_rx,
            next_height,
        ))
    }

    /// Greatest height covered by enqueued batches.
    #[must_use]
    pub fn latest_buffered_height(&self) -> u64 {
        self.shared.latest_buffered.load(Ordering::Acquire)
    }

    /// Drain pending work above `height` (fork rewind).
    pub fn flush_queue(&self, height: u64) {
        flush(&self.shared, height);
    }
}

/// Drain pending work and invalidate in-flight results.
///
/// Queued heights are strictly above `height` whenever this is called for a
/// rewind (anything at or below it already committed), so draining the
/// whole queue discards exactly the dead branch.
fn flush(shared: &DispatcherShared, height: u64) {
    // The epoch bump shares the queue lock with `next_height` so a worker
    // can never pair a post-flush height with a pre-flush epoch.
    let released = {
        let mut queue = shared.queue.lock();
        shared.epoch.fetch_add(1, Ordering::AcqRel);
        let before = queue.len();
        queue.clear();
        before
    };
    shared.payloads.lock().clear();
    shared.release(released);

    let buffered = shared.latest_buffered.load(Ordering::Acquire);
    shared
        .latest_buffered
        .store(buffered.min(height), Ordering::Release);

    debug!(height, released, "queue flushed");
}

impl BlockSink for BlockDispatcher {
    fn free_size(&self) -> usize {
        self.shared.free()
    }

    #[instrument(skip_all, fields(count = heights.len(), last_buffered))]
    fn enqueue_blocks(
        &self,
        heights: Vec<u64>,
        last_buffered: u64,
        payloads: HashMap<u64, FetchedBlock>,
    ) -> Result<()> {
        if heights.len() > self.shared.free() {
            return Err(IndexerError::InvariantViolation(format!(
                "enqueue of {} blocks exceeds free capacity {}",
                heights.len(),
                self.shared.free()
            )));
        }

        metrics::counter!("blocksift_blocks_enqueued_total").increment(heights.len() as u64);

        if !heights.is_empty() {
            self.shared
                .outstanding
                .fetch_add(heights.len(), Ordering::AcqRel);
            self.shared.queue.lock().extend(heights.iter().copied());
            self.shared.payloads.lock().extend(payloads);
            self.shared.work_notify.notify_waiters();
        }

        // An empty batch still advances the buffered watermark so the
        // fetcher's cursor can move past stretches with no matching blocks.
        let current = self.shared.latest_buffered.load(Ordering::Acquire);
        self.shared
            .latest_buffered
            .store(current.max(last_buffered), Ordering::Release);

        metrics::gauge!("blocksift_dispatcher_free_slots").set(self.shared.free() as f64);

        Ok(())
    }

    fn flush_queue(&self, height: u64) {
        flush(&self.shared, height);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMMITTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Commit loop: reorder worker results and commit strictly ascending.
async fn run_committer(
    shared: Arc<DispatcherShared>,
    store: Arc<dyn MetadataStore>,
    unfinalized: Arc<UnfinalizedBlocks>,
    events: mpsc::UnboundedSender<DispatcherEvent>,
    mut results: mpsc::Receiver<WorkerResult>,
    mut expected: u64,
) -> Result<()> {
    let mut buffer: BTreeMap<u64, Result<ProcessedBlock>> = BTreeMap::new();

    while let Some(result) = results.recv().await {
        if result.epoch < shared.epoch.load(Ordering::Acquire) {
            // Processed before a flush: the height belongs to a discarded
            // branch.
            shared.release(1);
            continue;
        }

        buffer.insert(result.height, result.outcome);

        // Commit everything that is now contiguous. A worker failure is
        // raised at its height's turn, so every predecessor still commits.
        while let Some(outcome) = buffer.remove(&expected) {
            let block = outcome?;
            let height = block.height;
            let dynamic = block.dynamic_data_sources.clone();
            let rewind = commit_block(&store, &unfinalized, block).await?;
            shared.release(1);

            match rewind {
                Some(target) => {
                    warn!(target, "fork rewind, flushing dispatcher");
                    flush(&shared, target);

                    // Everything buffered is above the rewind target.
                    shared.release(buffer.len());
                    buffer.clear();

                    expected = target + 1;
                    let _ = events.send(DispatcherEvent::Rewind(target));
                }
                None => {
                    expected = height + 1;
                    metrics::counter!("blocksift_blocks_committed_total").increment(1);
                    if !dynamic.is_empty() {
                        let _ = events.send(DispatcherEvent::NewDataSources {
                            height,
                            sources: dynamic,
                        });
                    }
                }
            }
        }
    }

    debug!("committer stopped");
    Ok(())
}

/// Commit one block: unfinalized bookkeeping plus `lastProcessedHeight`,
/// atomically. Returns the rewind target when the chain forked.
async fn commit_block(
    store: &Arc<dyn MetadataStore>,
    unfinalized: &Arc<UnfinalizedBlocks>,
    block: ProcessedBlock,
) -> Result<Option<u64>> {
    let tx = store.begin().await?;

    let result = async {
        let rewind = unfinalized
            .process_unfinalized_blocks(Some((block.height, block.hash)), tx)
            .await?;

        match rewind {
            Some(target) => {
                store.reindex(target, tx).await?;
                store
                    .upsert(keys::LAST_PROCESSED, &target.to_string(), tx)
                    .await?;
            }
            None => {
                store
                    .upsert(keys::LAST_PROCESSED, &block.height.to_string(), tx)
                    .await?;
            }
        }
        Ok(rewind)
    }
    .await;

    match result {
        Ok(rewind) => {
            store.commit(tx).await?;
            Ok(rewind)
        }
        Err(e) => {
            store.rollback(tx).await?;
            Err(e)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
