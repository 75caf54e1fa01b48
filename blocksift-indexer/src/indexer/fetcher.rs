//! Fetch service: the single driver loop issuing work to the dispatcher.
//!
//! Each iteration computes the next batch of heights from the chain tip,
//! the dictionary, the modulo schedules, and the bypass list:
//!
//! 1. Ask the dictionary for matching heights in `[cursor, cursor + Q]`
//!    (falling back to dense enumeration when it is unusable, behind, or
//!    times out)
//! 2. Overlay modulo heights (every Nth block schedules)
//! 3. Subtract bypassed heights
//! 4. Truncate to the dispatcher's free capacity and enqueue
//!
//! An empty batch still advances the cursor past the covered range. When
//! `free_size` is zero the driver sleeps briefly; when the cursor reaches
//! the target it waits for chain progress.
//!
//! The dispatcher feeds back through an event channel: fork rewinds reset
//! the cursor, dynamically created data sources rebuild the dictionary
//! conditions and re-prime the queue.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chain_api::types::FetchedBlock;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dictionary::DictionarySource;
use crate::error::Result;
use crate::indexer::dispatcher::{BlockSink, DispatcherEvent};
use crate::indexer::unfinalized::UnfinalizedBlocks;
use crate::ports::ChainSource;
use crate::types::{DataSource, DataSourceMap, build_data_source_map};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Ceiling for the chain-tip poll interval.
const BLOCK_TIME_VARIANCE: Duration = Duration::from_secs(5);

/// Sleep when the dispatcher reports no free capacity.
const BACKPRESSURE_SLEEP: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetch service configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Blocks per enqueued batch.
    pub batch_size: usize,
    /// Width of a dictionary query window.
    pub dictionary_query_size: u64,
    /// Heights the operator marked to skip entirely.
    pub bypass_blocks: HashSet<u64>,
    /// Follow the best tip (tracking unfinalized blocks) instead of the
    /// finalized tip.
    pub follow_unfinalized: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TIP TRACKER
// ═══════════════════════════════════════════════════════════════════════════════

/// Chain-tip observations and the derived poll cadence.
#[derive(Debug)]
struct TipTracker {
    finalized_height: u64,
    best_height: u64,
    last_best_change: Option<Instant>,
    /// Estimated seconds between blocks, from observed best-height motion.
    measured_interval: Duration,
    last_poll: Option<Instant>,
}

impl TipTracker {
    fn new() -> Self {
        Self {
            finalized_height: 0,
            best_height: 0,
            last_best_change: None,
            measured_interval: BLOCK_TIME_VARIANCE,
            last_poll: None,
        }
    }

    /// Poll every `min(BLOCK_TIME_VARIANCE, 0.9 × measured interval)`.
    fn poll_interval(&self) -> Duration {
        BLOCK_TIME_VARIANCE.min(self.measured_interval.mul_f64(0.9))
    }

    fn poll_due(&self) -> bool {
        self.last_poll
            .is_none_or(|last| last.elapsed() >= self.poll_interval())
    }

    fn observe(&mut self, finalized: u64, best: u64) {
        let now = Instant::now();
        self.last_poll = Some(now);
        self.finalized_height = self.finalized_height.max(finalized);

        if best > self.best_height {
            if let Some(previous) = self.last_best_change {
                let advanced = best - self.best_height;
                let per_block = previous.elapsed().div_f64(advanced as f64);
                // Smooth and keep sane bounds.
                self.measured_interval = per_block
                    .clamp(Duration::from_millis(100), Duration::from_secs(600));
            }
            self.best_height = best;
            self.last_best_change = Some(now);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BATCH PLAN
// ═══════════════════════════════════════════════════════════════════════════════

/// One iteration's worth of work.
#[derive(Debug, Default)]
struct BatchPlan {
    heights: Vec<u64>,
    last_buffered: u64,
    payloads: HashMap<u64, FetchedBlock>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// FETCH SERVICE
// ═══════════════════════════════════════════════════════════════════════════════

/// The driver loop.
pub struct FetchService {
    chain: Arc<dyn ChainSource>,
    dictionary: Arc<dyn DictionarySource>,
    sink: Arc<dyn BlockSink>,
    unfinalized: Arc<UnfinalizedBlocks>,
    /// Master list of data sources (static + dynamic).
    data_sources: Vec<DataSource>,
    /// Shared height map read by dispatcher workers.
    data_source_map: Arc<RwLock<DataSourceMap>>,
    /// Feedback from the dispatcher.
    events: mpsc::UnboundedReceiver<DispatcherEvent>,
    config: FetchConfig,
    /// Modulo strides across all data sources.
    modulos: Vec<u64>,
    /// Next height to fetch.
    cursor: u64,
}

impl std::fmt::Debug for FetchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchService")
            .field("cursor", &self.cursor)
            .field("data_sources", &self.data_sources.len())
            .finish_non_exhaustive()
    }
}

impl FetchService {
    /// Create a driver starting at `start_height`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainSource>,
        dictionary: Arc<dyn DictionarySource>,
        sink: Arc<dyn BlockSink>,
        unfinalized: Arc<UnfinalizedBlocks>,
        data_sources: Vec<DataSource>,
        data_source_map: Arc<RwLock<DataSourceMap>>,
        events: mpsc::UnboundedReceiver<DispatcherEvent>,
        config: FetchConfig,
        start_height: u64,
    ) -> Self {
        let modulos = collect_modulos(&data_sources);
        Self {
            chain,
            dictionary,
            sink,
            unfinalized,
            data_sources,
            data_source_map,
            events,
            config,
            modulos,
            cursor: start_height,
        }
    }

    /// Next height the driver will fetch.
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Run until cancelled. Fatal errors propagate.
    ///
    /// # Errors
    ///
    /// Unrecoverable errors only; chain hiccups are logged and retried.
    #[instrument(skip_all)]
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut tip = TipTracker::new();

        info!(cursor = self.cursor, "fetch service starting");

        loop {
            if token.is_cancelled() {
                debug!("fetch service stopping");
                return Ok(());
            }

            self.drain_events();

            if tip.poll_due() {
                match self.poll_tip().await {
                    Ok((finalized, best)) => tip.observe(finalized, best),
                    Err(e) => warn!(error = %e, "chain tip poll failed"),
                }
            }

            let target = if self.config.follow_unfinalized {
                tip.best_height
            } else {
                tip.finalized_height
            };

            // Caught up or throttled: wait for something to change.
            if target == 0 || self.cursor > target || self.sink.free_size() == 0 {
                let sleep = if self.sink.free_size() == 0 {
                    BACKPRESSURE_SLEEP
                } else {
                    tip.poll_interval().min(BACKPRESSURE_SLEEP)
                };
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(sleep) => {}
                    event = self.events.recv() => {
                        if let Some(event) = event {
                            self.handle_event(event);
                        }
                    }
                }
                continue;
            }

            self.fetch_iteration(target, tip.finalized_height).await?;
        }
    }

    /// Drain dispatcher feedback without blocking.
    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::Rewind(target) => {
                info!(target, "rewinding cursor after fork");
                self.cursor = target + 1;
            }
            DispatcherEvent::NewDataSources { height, sources } => {
                if let Err(e) = self.reset_for_new_ds(height, sources) {
                    warn!(error = %e, "failed to apply dynamic data sources");
                }
            }
        }
    }

    async fn poll_tip(&self) -> Result<(u64, u64)> {
        let finalized = self.chain.finalized_header().await?;
        let best = self.chain.best_height().await?;
        let finalized_height = finalized.number;
        self.unfinalized.register_finalized(finalized).await;
        Ok((finalized_height, best))
    }

    /// Compute and enqueue one batch. Returns whether anything was enqueued.
    async fn fetch_iteration(&mut self, target: u64, finalized: u64) -> Result<bool> {
        let free = self.sink.free_size();
        if free == 0 {
            return Ok(false);
        }

        let mut plan = self.plan_batch(target, finalized).await;

        // Bypass blocks disappear from every batch.
        if !self.config.bypass_blocks.is_empty() {
            plan.heights
                .retain(|height| !self.config.bypass_blocks.contains(height));
            plan.payloads
                .retain(|height, _| !self.config.bypass_blocks.contains(height));
        }

        // The dispatcher only has `free` slots; defer the rest.
        if plan.heights.len() > free {
            plan.heights.truncate(free);
            if let Some(&last) = plan.heights.last() {
                plan.last_buffered = last;
                plan.payloads.retain(|height, _| *height <= last);
            }
        }

        debug!(
            cursor = self.cursor,
            count = plan.heights.len(),
            last_buffered = plan.last_buffered,
            "enqueuing batch"
        );

        self.sink
            .enqueue_blocks(plan.heights, plan.last_buffered, plan.payloads)?;
        self.cursor = plan.last_buffered + 1;
        Ok(true)
    }

    /// Dictionary heights (or dense fallback) with the modulo overlay.
    async fn plan_batch(&self, target: u64, finalized: u64) -> BatchPlan {
        let cursor = self.cursor;
        let query_end = cursor
            .saturating_add(self.config.dictionary_query_size)
            .min(target);

        let mut plan = if self.dictionary.usable(cursor)
            && cursor >= self.dictionary.start_height()
        {
            match self
                .dictionary
                .scrape(cursor, query_end, self.config.batch_size, finalized)
                .await
            {
                Some(response) => BatchPlan {
                    heights: response.batch_blocks,
                    last_buffered: response.last_buffered_height,
                    payloads: response.payloads,
                },
                None => self.dense_plan(target),
            }
        } else {
            self.dense_plan(target)
        };

        self.overlay_modulos(&mut plan, target);
        plan
    }

    fn dense_plan(&self, target: u64) -> BatchPlan {
        let last = self
            .cursor
            .saturating_add(self.config.batch_size as u64 - 1)
            .min(target);
        BatchPlan {
            heights: (self.cursor..=last).collect(),
            last_buffered: last,
            payloads: HashMap::new(),
        }
    }

    /// Merge modulo-scheduled heights into the plan: sorted, unique, and
    /// re-truncated to the batch size (the stride may push the batch past
    /// the dictionary's covered range).
    fn overlay_modulos(&self, plan: &mut BatchPlan, target: u64) {
        if self.modulos.is_empty() {
            return;
        }

        let mut merged: BTreeSet<u64> = plan.heights.iter().copied().collect();
        for &modulo in &self.modulos {
            if modulo == 0 {
                continue;
            }
            // Only the first batch-size multiples can survive truncation.
            let mut k = self.cursor.div_ceil(modulo) * modulo;
            for _ in 0..self.config.batch_size {
                if k > target {
                    break;
                }
                merged.insert(k);
                k += modulo;
            }
        }

        let mut heights: Vec<u64> = merged.into_iter().collect();
        if heights.len() > self.config.batch_size {
            heights.truncate(self.config.batch_size);
        }

        if let Some(&last) = heights.last() {
            plan.last_buffered = plan.last_buffered.max(last);
            // Truncation may have cut the covered range short.
            if heights.len() == self.config.batch_size {
                plan.last_buffered = last;
            }
        }
        plan.heights = heights;
    }

    /// Handlers created data sources at `height`: rebuild the maps and
    /// conditions, drop queued work, and resume right after the creating
    /// block with the new sources active.
    fn reset_for_new_ds(&mut self, height: u64, sources: Vec<DataSource>) -> Result<()> {
        let lowest_start = sources
            .iter()
            .map(|ds| ds.start_block)
            .min()
            .unwrap_or(height + 1);

        info!(
            height,
            added = sources.len(),
            lowest_start,
            "dynamic data sources created"
        );

        self.data_sources.extend(sources);
        let map = build_data_source_map(&self.data_sources);
        self.modulos = collect_modulos(&self.data_sources);
        self.dictionary.update_queries_map(&map)?;
        *self.data_source_map.write() = map;

        self.sink.flush_queue(height);
        // The creating block is committed; nothing below it needs refetching.
        self.cursor = lowest_start.max(height + 1);
        Ok(())
    }
}

/// Every modulo stride declared by any data source, sorted and unique.
fn collect_modulos(data_sources: &[DataSource]) -> Vec<u64> {
    let mut modulos: Vec<u64> = data_sources
        .iter()
        .flat_map(|ds| ds.modulos())
        .filter(|&m| m > 0)
        .collect();
    modulos.sort_unstable();
    modulos.dedup();
    modulos
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chain_api::types::BlockHeader;

    use super::*;
    use crate::dictionary::DictionaryResponse;
    use crate::error::IndexerError;
    use crate::ports::HeaderSource;
    use crate::store::MemoryMetadataStore;

    // ───────────────────────────────────────────────────────────────────────────
    // MOCKS
    // ───────────────────────────────────────────────────────────────────────────

    #[derive(Debug, Default)]
    struct MockDictionary {
        start_height: u64,
        /// Scripted responses, popped per scrape call.
        responses: StdMutex<Vec<Option<DictionaryResponse>>>,
        scrapes: AtomicU32,
    }

    impl MockDictionary {
        fn returning(heights: Vec<u64>, last_buffered: u64) -> Self {
            Self {
                responses: StdMutex::new(vec![Some(DictionaryResponse {
                    batch_blocks: heights,
                    last_buffered_height: last_buffered,
                    payloads: HashMap::new(),
                })]),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DictionarySource for MockDictionary {
        fn usable(&self, start: u64) -> bool {
            start >= self.start_height
        }

        fn start_height(&self) -> u64 {
            self.start_height
        }

        fn update_queries_map(&self, _map: &DataSourceMap) -> Result<()> {
            Ok(())
        }

        async fn scrape(
            &self,
            _start: u64,
            _end: u64,
            _limit: usize,
            _finalized: u64,
        ) -> Option<DictionaryResponse> {
            self.scrapes.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().expect("lock").pop().flatten()
        }
    }

    /// Records every enqueue; reports a scripted free size.
    #[derive(Debug)]
    struct RecordingSink {
        free: AtomicUsize,
        enqueues: StdMutex<Vec<(Vec<u64>, u64)>>,
        flushes: StdMutex<Vec<u64>>,
    }

    impl RecordingSink {
        fn with_free(free: usize) -> Self {
            Self {
                free: AtomicUsize::new(free),
                enqueues: StdMutex::new(vec![]),
                flushes: StdMutex::new(vec![]),
            }
        }

        fn enqueued(&self) -> Vec<(Vec<u64>, u64)> {
            self.enqueues.lock().expect("lock").clone()
        }
    }

    impl BlockSink for RecordingSink {
        fn free_size(&self) -> usize {
            self.free.load(Ordering::SeqCst)
        }

        fn enqueue_blocks(
            &self,
            heights: Vec<u64>,
            last_buffered: u64,
            _payloads: HashMap<u64, FetchedBlock>,
        ) -> Result<()> {
            self.enqueues
                .lock()
                .expect("lock")
                .push((heights, last_buffered));
            Ok(())
        }

        fn flush_queue(&self, height: u64) {
            self.flushes.lock().expect("lock").push(height);
        }
    }

    #[derive(Debug)]
    struct StaticChain;

    #[async_trait]
    impl ChainSource for StaticChain {
        async fn finalized_header(&self) -> Result<BlockHeader> {
            Err(IndexerError::Store("not used".into()))
        }

        async fn best_height(&self) -> Result<u64> {
            Err(IndexerError::Store("not used".into()))
        }
    }

    #[derive(Debug)]
    struct NoHeaders;

    #[async_trait]
    impl HeaderSource for NoHeaders {
        async fn header_by_height(&self, _height: u64) -> Result<BlockHeader> {
            Err(IndexerError::Store("not used".into()))
        }

        async fn header_by_hash(
            &self,
            _hash: alloy::primitives::B256,
        ) -> Result<BlockHeader> {
            Err(IndexerError::Store("not used".into()))
        }
    }

    fn service(
        dictionary: Arc<MockDictionary>,
        sink: Arc<RecordingSink>,
        config: FetchConfig,
        start: u64,
    ) -> (FetchService, mpsc::UnboundedSender<DispatcherEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let unfinalized = Arc::new(UnfinalizedBlocks::new(
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(NoHeaders),
        ));
        let service = FetchService::new(
            Arc::new(StaticChain),
            dictionary,
            sink,
            unfinalized,
            vec![],
            Arc::new(RwLock::new(DataSourceMap::default())),
            events_rx,
            config,
            start,
        );
        (service, events_tx)
    }

    fn config(batch_size: usize) -> FetchConfig {
        FetchConfig {
            batch_size,
            dictionary_query_size: 10_000,
            bypass_blocks: HashSet::new(),
            follow_unfinalized: false,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // CATCH-UP SCENARIOS
    // ───────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn catch_up_with_dictionary() {
        let dictionary = Arc::new(MockDictionary::returning(vec![2, 4, 6, 8, 10], 1_000));
        let sink = Arc::new(RecordingSink::with_free(100));
        let (mut service, _events) = service(dictionary, sink.clone(), config(10), 1);

        service.fetch_iteration(1_000, 1_000).await.expect("iterate");

        assert_eq!(sink.enqueued(), vec![(vec![2, 4, 6, 8, 10], 1_000)]);
        assert_eq!(service.cursor(), 1_001);
    }

    #[tokio::test]
    async fn dictionary_behind_start_falls_back_dense() {
        let dictionary = Arc::new(MockDictionary {
            start_height: 100,
            ..MockDictionary::default()
        });
        let sink = Arc::new(RecordingSink::with_free(100));
        let (mut service, _events) = service(dictionary.clone(), sink.clone(), config(10), 1);

        service.fetch_iteration(1_000, 1_000).await.expect("iterate");

        // The dictionary was never consulted; dense enumeration instead.
        assert_eq!(dictionary.scrapes.load(Ordering::SeqCst), 0);
        assert_eq!(sink.enqueued(), vec![((1..=10).collect(), 10)]);
        assert_eq!(service.cursor(), 11);
    }

    #[tokio::test]
    async fn empty_dictionary_response_advances_and_retries() {
        let dictionary = Arc::new(MockDictionary {
            responses: StdMutex::new(vec![
                // Second iteration's answer (popped last).
                Some(DictionaryResponse {
                    batch_blocks: vec![1_005],
                    last_buffered_height: 2_000,
                    payloads: HashMap::new(),
                }),
                // First iteration: nothing matched up to 1000.
                Some(DictionaryResponse {
                    batch_blocks: vec![],
                    last_buffered_height: 1_000,
                    payloads: HashMap::new(),
                }),
            ]),
            ..MockDictionary::default()
        });
        let sink = Arc::new(RecordingSink::with_free(100));
        let (mut service, _events) = service(dictionary.clone(), sink.clone(), config(10), 1);

        service.fetch_iteration(2_000, 2_000).await.expect("first");
        assert_eq!(service.cursor(), 1_001);

        // Not latched: the next cycle consults the dictionary again.
        service.fetch_iteration(2_000, 2_000).await.expect("second");
        assert_eq!(dictionary.scrapes.load(Ordering::SeqCst), 2);

        assert_eq!(
            sink.enqueued(),
            vec![(vec![], 1_000), (vec![1_005], 2_000)]
        );
    }

    #[tokio::test]
    async fn modulo_union_extends_past_dictionary_buffer() {
        let dictionary = Arc::new(MockDictionary::returning(vec![2, 4, 6, 8, 10], 10));
        let sink = Arc::new(RecordingSink::with_free(100));

        let (mut service, _events) = service(dictionary, sink.clone(), config(10), 1);
        service.modulos = vec![3];

        service.fetch_iteration(1_000, 1_000).await.expect("iterate");

        // Union of dictionary heights and every 3rd block, sorted, deduped,
        // truncated to the batch size; the stride pushed the batch past the
        // dictionary's covered range.
        assert_eq!(
            sink.enqueued(),
            vec![(vec![2, 3, 4, 6, 8, 9, 10, 12, 15, 18], 18)]
        );
        assert_eq!(service.cursor(), 19);
    }

    #[tokio::test]
    async fn rewind_event_resets_cursor() {
        let dictionary = Arc::new(MockDictionary::default());
        let sink = Arc::new(RecordingSink::with_free(100));
        let (mut service, events) = service(dictionary, sink, config(10), 500);

        events
            .send(DispatcherEvent::Rewind(99))
            .expect("send");
        service.drain_events();

        assert_eq!(service.cursor(), 100);
    }

    // ───────────────────────────────────────────────────────────────────────────
    // BOUNDARIES
    // ───────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn bypass_blocks_are_subtracted() {
        let dictionary = Arc::new(MockDictionary::default());
        let sink = Arc::new(RecordingSink::with_free(100));
        let mut cfg = config(10);
        cfg.bypass_blocks = HashSet::from([2, 3, 4, 5]);

        let (mut service, _events) = service(dictionary, sink.clone(), cfg, 1);
        service.fetch_iteration(1_000, 1_000).await.expect("iterate");

        assert_eq!(sink.enqueued(), vec![(vec![1, 6, 7, 8, 9, 10], 10)]);
        assert_eq!(service.cursor(), 11);
    }

    #[tokio::test]
    async fn free_size_truncates_and_defers() {
        let dictionary = Arc::new(MockDictionary::default());
        let sink = Arc::new(RecordingSink::with_free(3));
        let (mut service, _events) = service(dictionary, sink.clone(), config(10), 1);

        service.fetch_iteration(1_000, 1_000).await.expect("iterate");

        // Only three slots: the batch is cut and the cursor follows the cut.
        assert_eq!(sink.enqueued(), vec![(vec![1, 2, 3], 3)]);
        assert_eq!(service.cursor(), 4);
    }

    #[tokio::test]
    async fn zero_free_size_is_backpressure() {
        let dictionary = Arc::new(MockDictionary::default());
        let sink = Arc::new(RecordingSink::with_free(0));
        let (mut service, _events) = service(dictionary, sink.clone(), config(10), 1);

        let progressed = service.fetch_iteration(1_000, 1_000).await.expect("iterate");
        assert!(!progressed);
        assert!(sink.enqueued().is_empty());
        assert_eq!(service.cursor(), 1);
    }

    #[tokio::test]
    async fn dense_plan_stops_at_target() {
        let dictionary = Arc::new(MockDictionary::default());
        let sink = Arc::new(RecordingSink::with_free(100));
        let (mut service, _events) = service(dictionary, sink.clone(), config(10), 998);

        service.fetch_iteration(1_000, 1_000).await.expect("iterate");

        assert_eq!(sink.enqueued(), vec![(vec![998, 999, 1_000], 1_000)]);
        assert_eq!(service.cursor(), 1_001);
    }

    #[tokio::test]
    async fn dynamic_data_sources_reset() {
        use crate::types::{DataSourceOptions, Handler, HandlerSpec, Mapping};

        let dictionary = Arc::new(MockDictionary::default());
        let sink = Arc::new(RecordingSink::with_free(100));
        let (mut service, events) = service(dictionary, sink.clone(), config(10), 700);

        let dynamic = DataSource {
            kind: "ethereum/Runtime".into(),
            start_block: 651,
            end_block: None,
            options: DataSourceOptions::default(),
            mapping: Mapping {
                handlers: vec![Handler {
                    handler: "handleDynamic".into(),
                    spec: HandlerSpec::Block {
                        filter: Some(crate::types::BlockFilter { modulo: Some(7) }),
                    },
                }],
            },
        };

        events
            .send(DispatcherEvent::NewDataSources {
                height: 650,
                sources: vec![dynamic],
            })
            .expect("send");
        service.drain_events();

        // Queue flushed at the creating height; cursor resumes after it.
        assert_eq!(*sink.flushes.lock().expect("lock"), vec![650]);
        assert_eq!(service.cursor(), 651);
        assert_eq!(service.modulos, vec![7]);
        assert_eq!(service.data_sources.len(), 1);
    }

    #[test]
    fn tip_tracker_poll_interval_is_bounded() {
        let mut tip = TipTracker::new();
        assert_eq!(tip.poll_interval(), BLOCK_TIME_VARIANCE.mul_f64(0.9));

        // A fast chain tightens the cadence below the ceiling.
        tip.measured_interval = Duration::from_secs(2);
        assert_eq!(tip.poll_interval(), Duration::from_millis(1_800));

        // A slow chain is capped by the variance ceiling.
        tip.measured_interval = Duration::from_secs(60);
        assert_eq!(tip.poll_interval(), BLOCK_TIME_VARIANCE);
    }

    #[test]
    fn collect_modulos_dedupes() {
        use crate::types::{DataSourceOptions, Handler, HandlerSpec, Mapping};

        let ds = |modulo: u64| DataSource {
            kind: String::new(),
            start_block: 1,
            end_block: None,
            options: DataSourceOptions::default(),
            mapping: Mapping {
                handlers: vec![Handler {
                    handler: "h".into(),
                    spec: HandlerSpec::Block {
                        filter: Some(crate::types::BlockFilter { modulo: Some(modulo) }),
                    },
                }],
            },
        };

        assert_eq!(collect_modulos(&[ds(5), ds(3), ds(5)]), vec![3, 5]);
    }
}
