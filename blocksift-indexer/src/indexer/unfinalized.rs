//! Unfinalized-block tracking and fork recovery.
//!
//! The tracker remembers `(height, hash)` for every block processed above
//! the finalized tip. When the finalized tip advances, the records at or
//! below it become *verifiable*: their hashes are compared against the
//! canonical chain. A mismatch means the chain reorganized under us, and
//! the tracker computes the rewind height (the highest record that still
//! matches canon) for the dispatcher to flush to and the store to reindex.
//!
//! ```text
//! unfinalized: (100,A) (101,B) (102,C)        finalized tip: 101, hash B′
//!
//!                    ┌── B′ ≠ B → fork ──┐
//!   walk backward:   101: B′ vs B  ✗     │
//!                    100: A′ vs A  ✗     │
//!   nothing matches → rewind to lastCheckedBlockHeight (99)
//! ```
//!
//! # Durability
//!
//! The whole record list and `lastFinalizedVerifiedHeight` are serialized
//! to the metadata store inside the caller's transaction, so rewinds and
//! commits stay atomic. Cold start replays the check before indexing
//! resumes and issues the reindex in the same transaction.

use std::sync::Arc;

use alloy::primitives::B256;
use chain_api::types::BlockHeader;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{IndexerError, Result};
use crate::ports::{HeaderSource, MetadataStore, StoreTx, keys};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Beyond this gap, walking the parent-hash chain costs more than asking for
/// the canonical header at the target height directly.
const PARENT_WALK_LIMIT: u64 = 200;

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// One tracked record: the block's height and the hash *we* processed.
pub type UnfinalizedRecord = (u64, B256);

#[derive(Debug, Default)]
struct TrackerState {
    /// Records above the finalized tip, ascending, heights consecutive.
    unfinalized: Vec<UnfinalizedRecord>,
    /// Most recent finalized header (written only by the fetch driver).
    finalized_header: Option<BlockHeader>,
    /// Greatest height verified against canon; the best safe rewind point
    /// when nothing newer matches.
    last_checked_block_height: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACKER
// ═══════════════════════════════════════════════════════════════════════════════

/// Tracks unfinalized blocks and detects forks.
pub struct UnfinalizedBlocks {
    store: Arc<dyn MetadataStore>,
    headers: Arc<dyn HeaderSource>,
    state: Mutex<TrackerState>,
}

impl std::fmt::Debug for UnfinalizedBlocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnfinalizedBlocks").finish_non_exhaustive()
    }
}

impl UnfinalizedBlocks {
    /// Create a tracker with empty state.
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, headers: Arc<dyn HeaderSource>) -> Self {
        Self {
            store,
            headers,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Cold-start initialization: load persisted records, replay the fork
    /// check against the current finalized header, and issue the reindex
    /// inside one transaction.
    ///
    /// Returns the rewind height when the chain forked while we were down.
    ///
    /// # Errors
    ///
    /// Returns store or header-fetch errors.
    #[instrument(skip_all, fields(finalized = finalized.number))]
    pub async fn init(&self, finalized: BlockHeader) -> Result<Option<u64>> {
        {
            let mut state = self.state.lock().await;
            state.unfinalized = match self.store.read(keys::UNFINALIZED_BLOCKS).await? {
                Some(raw) => decode_records(&raw)?,
                None => Vec::new(),
            };
            state.last_checked_block_height = self
                .store
                .read(keys::LAST_FINALIZED_VERIFIED)
                .await?
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);
            state.finalized_header = Some(finalized);

            debug!(
                records = state.unfinalized.len(),
                last_checked = state.last_checked_block_height,
                "loaded unfinalized state"
            );
        }

        let tx = self.store.begin().await?;
        let rewind = match self.process_unfinalized_blocks(None, tx).await {
            Ok(rewind) => rewind,
            Err(e) => {
                self.store.rollback(tx).await?;
                return Err(e);
            }
        };

        if let Some(target) = rewind {
            warn!(target, "fork detected during cold start, reindexing");
            self.store.reindex(target, tx).await?;
        }
        self.store.commit(tx).await?;

        Ok(rewind)
    }

    /// Record a new finalized tip. Non-monotonic updates are ignored.
    pub async fn register_finalized(&self, header: BlockHeader) {
        let mut state = self.state.lock().await;
        let current = state.finalized_header.as_ref().map_or(0, |h| h.number);
        if state.finalized_header.is_none() || header.number > current {
            state.finalized_header = Some(header);
        }
    }

    /// Height of the registered finalized tip, if any.
    pub async fn finalized_height(&self) -> Option<u64> {
        self.state.lock().await.finalized_header.as_ref().map(|h| h.number)
    }

    /// Count of tracked records (tests and metrics).
    pub async fn record_count(&self) -> usize {
        self.state.lock().await.unfinalized.len()
    }

    /// Register a processed block above the finalized tip.
    ///
    /// Heights at or below the finalized tip are silently dropped. A height
    /// that is neither `last + 1` nor the first record is fatal: it means
    /// the dispatcher's ordering broke upstream.
    ///
    /// # Errors
    ///
    /// [`IndexerError::InvariantViolation`] on out-of-order registration;
    /// store errors from persisting.
    pub async fn register_unfinalized(&self, height: u64, hash: B256, tx: StoreTx) -> Result<()> {
        let mut state = self.state.lock().await;
        register_record(&mut state, height, hash)?;
        self.persist(&state, tx).await
    }

    /// Register an optional new block, run the fork check, and persist.
    ///
    /// Returns `Some(rewind_height)` when the chain forked; the caller must
    /// flush its queue, reindex, and resume from `rewind_height + 1`.
    ///
    /// # Errors
    ///
    /// Invariant violations, header-fetch errors, and store errors.
    #[instrument(skip_all)]
    pub async fn process_unfinalized_blocks(
        &self,
        new_block: Option<UnfinalizedRecord>,
        tx: StoreTx,
    ) -> Result<Option<u64>> {
        let mut state = self.state.lock().await;

        if let Some((height, hash)) = new_block {
            register_record(&mut state, height, hash)?;
        }

        let Some(finalized) = state.finalized_header.clone() else {
            self.persist(&state, tx).await?;
            return Ok(None);
        };

        if self.has_forked(&state, &finalized).await? {
            warn!(
                finalized = finalized.number,
                finalized_hash = %finalized.hash,
                "fork detected below finalized tip"
            );
            metrics::counter!("blocksift_forks_detected_total").increment(1);

            let rewind = self
                .last_correct_finalized_height(&state, &finalized)
                .await?
                .unwrap_or(state.last_checked_block_height);

            // Records above the rewind point are on the dead branch.
            state.unfinalized.retain(|(height, _)| *height <= rewind);
            self.persist(&state, tx).await?;

            info!(rewind, "computed rewind target");
            return Ok(Some(rewind));
        }

        // Verified clean: records at or below the tip are confirmed.
        state
            .unfinalized
            .retain(|(height, _)| *height > finalized.number);
        state.last_checked_block_height = finalized.number;
        self.persist(&state, tx).await?;

        Ok(None)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // FORK DETECTION
    // ───────────────────────────────────────────────────────────────────────────

    /// Compare the newest verifiable record against the canonical chain.
    async fn has_forked(&self, state: &TrackerState, finalized: &BlockHeader) -> Result<bool> {
        let Some((height, hash)) = state
            .unfinalized
            .iter()
            .rev()
            .find(|(height, _)| *height <= finalized.number)
            .copied()
        else {
            return Ok(false);
        };

        if height == finalized.number {
            return Ok(hash != finalized.hash);
        }

        // The record is below the tip: resolve the canonical hash at its
        // height, walking parents for small gaps and jumping directly when
        // the walk would be longer than PARENT_WALK_LIMIT.
        let gap = finalized.number - height;
        let canonical_hash = if gap > PARENT_WALK_LIMIT {
            self.headers.header_by_height(height).await?.hash
        } else {
            let mut cursor = finalized.clone();
            while cursor.number > height + 1 {
                cursor = self.headers.header_by_hash(cursor.parent_hash).await?;
            }
            cursor.parent_hash
        };

        Ok(canonical_hash != hash)
    }

    /// Walk verifiable records newest-first, returning the first height
    /// whose recorded hash still matches canon.
    async fn last_correct_finalized_height(
        &self,
        state: &TrackerState,
        finalized: &BlockHeader,
    ) -> Result<Option<u64>> {
        // Canonical header one above the record being checked, when known;
        // its parent hash settles the record without another fetch.
        let mut child: Option<BlockHeader> = None;

        for (height, hash) in state
            .unfinalized
            .iter()
            .rev()
            .filter(|(height, _)| *height <= finalized.number)
        {
            if let Some(child) = &child {
                if child.number == height + 1 && child.parent_hash == *hash {
                    return Ok(Some(*height));
                }
            }

            let canonical = self.headers.header_by_height(*height).await?;
            if canonical.hash == *hash {
                return Ok(Some(*height));
            }
            child = Some(canonical);
        }

        Ok(None)
    }

    async fn persist(&self, state: &TrackerState, tx: StoreTx) -> Result<()> {
        self.store
            .upsert(keys::UNFINALIZED_BLOCKS, &encode_records(&state.unfinalized)?, tx)
            .await?;
        self.store
            .upsert(
                keys::LAST_FINALIZED_VERIFIED,
                &state.last_checked_block_height.to_string(),
                tx,
            )
            .await
    }
}

/// Append a record, enforcing the consecutive-heights invariant.
fn register_record(state: &mut TrackerState, height: u64, hash: B256) -> Result<()> {
    if let Some(finalized) = &state.finalized_header {
        if height <= finalized.number {
            debug!(height, finalized = finalized.number, "dropping already-final block");
            return Ok(());
        }
    }

    if let Some((last, _)) = state.unfinalized.last() {
        if height != last + 1 {
            return Err(IndexerError::InvariantViolation(format!(
                "unfinalized registration out of order: got {height}, expected {}",
                last + 1
            )));
        }
    }

    state.unfinalized.push((height, hash));
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// PERSISTENCE ENCODING
// ═══════════════════════════════════════════════════════════════════════════════

/// Encode records as a JSON array of `[height, "0x…"]` pairs.
fn encode_records(records: &[UnfinalizedRecord]) -> Result<String> {
    let wire: Vec<(u64, String)> = records
        .iter()
        .map(|(height, hash)| (*height, format!("{hash}")))
        .collect();
    Ok(serde_json::to_string(&wire)?)
}

fn decode_records(raw: &str) -> Result<Vec<UnfinalizedRecord>> {
    let wire: Vec<(u64, String)> = serde_json::from_str(raw)?;
    wire.into_iter()
        .map(|(height, hash)| {
            hash.parse()
                .map(|hash| (height, hash))
                .map_err(|e| IndexerError::Store(format!("corrupt unfinalized hash {hash:?}: {e}")))
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::store::MemoryMetadataStore;

    fn header(number: u64, hash_byte: u8, parent_byte: u8) -> BlockHeader {
        BlockHeader {
            number,
            hash: B256::from([hash_byte; 32]),
            parent_hash: B256::from([parent_byte; 32]),
            timestamp: 1_700_000_000 + number * 12,
            state_root: B256::ZERO,
            logs_bloom: Default::default(),
            gas_limit: 30_000_000,
            gas_used: 0,
            base_fee_per_gas: None,
        }
    }

    /// Canonical chain served to the tracker.
    #[derive(Debug, Default)]
    struct MockHeaders {
        by_height: HashMap<u64, BlockHeader>,
        by_hash: HashMap<B256, BlockHeader>,
        height_calls: AtomicU32,
        hash_calls: AtomicU32,
    }

    impl MockHeaders {
        fn with_chain(headers: Vec<BlockHeader>) -> Self {
            let mut mock = Self::default();
            for header in headers {
                mock.by_hash.insert(header.hash, header.clone());
                mock.by_height.insert(header.number, header);
            }
            mock
        }
    }

    #[async_trait]
    impl HeaderSource for MockHeaders {
        async fn header_by_height(&self, height: u64) -> Result<BlockHeader> {
            self.height_calls.fetch_add(1, Ordering::SeqCst);
            self.by_height
                .get(&height)
                .cloned()
                .ok_or_else(|| IndexerError::Store(format!("no header at {height}")))
        }

        async fn header_by_hash(&self, hash: B256) -> Result<BlockHeader> {
            self.hash_calls.fetch_add(1, Ordering::SeqCst);
            self.by_hash
                .get(&hash)
                .cloned()
                .ok_or_else(|| IndexerError::Store(format!("no header {hash}")))
        }
    }

    fn tracker(
        store: Arc<MemoryMetadataStore>,
        headers: MockHeaders,
    ) -> UnfinalizedBlocks {
        UnfinalizedBlocks::new(store, Arc::new(headers))
    }

    async fn in_tx<F, Fut, T>(store: &Arc<MemoryMetadataStore>, f: F) -> T
    where
        F: FnOnce(StoreTx) -> Fut,
        Fut: Future<Output = T>,
    {
        let tx = store.begin().await.unwrap();
        let out = f(tx).await;
        store.commit(tx).await.unwrap();
        out
    }

    #[tokio::test]
    async fn registration_enforces_consecutive_heights() {
        let store = Arc::new(MemoryMetadataStore::new());
        let tracker = tracker(store.clone(), MockHeaders::default());

        let tx = store.begin().await.unwrap();
        tracker
            .register_unfinalized(100, B256::from([0xAA; 32]), tx)
            .await
            .unwrap();
        tracker
            .register_unfinalized(101, B256::from([0xBB; 32]), tx)
            .await
            .unwrap();

        // A gap is an upstream ordering bug.
        let result = tracker
            .register_unfinalized(105, B256::from([0xCC; 32]), tx)
            .await;
        assert!(matches!(result, Err(IndexerError::InvariantViolation(_))));
        store.commit(tx).await.unwrap();

        assert_eq!(tracker.record_count().await, 2);
    }

    #[tokio::test]
    async fn registration_drops_already_final_heights() {
        let store = Arc::new(MemoryMetadataStore::new());
        let tracker = tracker(store.clone(), MockHeaders::default());
        tracker.register_finalized(header(100, 0x64, 0x63)).await;

        let tx = store.begin().await.unwrap();
        tracker
            .register_unfinalized(99, B256::from([0xAA; 32]), tx)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();
        assert_eq!(tracker.record_count().await, 0);
    }

    #[tokio::test]
    async fn register_finalized_is_monotonic() {
        let store = Arc::new(MemoryMetadataStore::new());
        let tracker = tracker(store, MockHeaders::default());

        tracker.register_finalized(header(100, 1, 0)).await;
        tracker.register_finalized(header(90, 2, 0)).await;
        assert_eq!(tracker.finalized_height().await, Some(100));

        tracker.register_finalized(header(110, 3, 0)).await;
        assert_eq!(tracker.finalized_height().await, Some(110));
    }

    #[tokio::test]
    async fn clean_finalization_confirms_records() {
        let store = Arc::new(MemoryMetadataStore::new());
        let finalized = header(101, 0xBB, 0xAA);
        let headers = MockHeaders::with_chain(vec![header(100, 0xAA, 0x99), finalized.clone()]);
        let tracker = tracker(store.clone(), headers);

        in_tx(&store, |tx| async move {
            tracker
                .register_unfinalized(100, B256::from([0xAA; 32]), tx)
                .await
                .unwrap();
            tracker
                .register_unfinalized(101, B256::from([0xBB; 32]), tx)
                .await
                .unwrap();
            tracker
                .register_unfinalized(102, B256::from([0xCC; 32]), tx)
                .await
                .unwrap();

            tracker.register_finalized(finalized).await;
            let rewind = tracker.process_unfinalized_blocks(None, tx).await.unwrap();
            assert_eq!(rewind, None);

            // No record at or below the finalized tip survives.
            assert_eq!(tracker.record_count().await, 1);
        })
        .await;

        assert_eq!(
            store.get(keys::LAST_FINALIZED_VERIFIED),
            Some("101".into())
        );
        let persisted = store.get(keys::UNFINALIZED_BLOCKS).expect("persisted");
        assert_eq!(decode_records(&persisted).unwrap(), vec![(102, B256::from([0xCC; 32]))]);
    }

    #[tokio::test]
    async fn fork_recovery_rewinds_to_last_checked_when_nothing_matches() {
        let store = Arc::new(MemoryMetadataStore::new());

        // Canonical chain disagrees everywhere: 100 is A′, 101 is B′.
        let canonical_100 = header(100, 0xA1, 0x99);
        let canonical_101 = header(101, 0xB1, 0xA1);
        let headers = MockHeaders::with_chain(vec![canonical_100, canonical_101.clone()]);
        let tracker = tracker(store.clone(), headers);

        let rewind = in_tx(&store, |tx| async move {
            tracker
                .register_unfinalized(100, B256::from([0xAA; 32]), tx)
                .await
                .unwrap();
            tracker
                .register_unfinalized(101, B256::from([0xBB; 32]), tx)
                .await
                .unwrap();
            tracker
                .register_unfinalized(102, B256::from([0xCC; 32]), tx)
                .await
                .unwrap();

            // Pretend heights up to 99 were verified earlier.
            {
                let mut state = tracker.state.lock().await;
                state.last_checked_block_height = 99;
            }

            tracker.register_finalized(canonical_101).await;
            tracker.process_unfinalized_blocks(None, tx).await.unwrap()
        })
        .await;

        assert_eq!(rewind, Some(99));
    }

    #[tokio::test]
    async fn fork_recovery_finds_matching_ancestor() {
        let store = Arc::new(MemoryMetadataStore::new());

        // 100 matches what we processed; 101 diverged.
        let canonical_100 = header(100, 0xAA, 0x99);
        let canonical_101 = header(101, 0xB1, 0xAA);
        let headers = MockHeaders::with_chain(vec![canonical_100, canonical_101.clone()]);
        let tracker = tracker(store.clone(), headers);

        let rewind = in_tx(&store, |tx| async move {
            tracker
                .register_unfinalized(100, B256::from([0xAA; 32]), tx)
                .await
                .unwrap();
            tracker
                .register_unfinalized(101, B256::from([0xBB; 32]), tx)
                .await
                .unwrap();

            tracker.register_finalized(canonical_101).await;
            tracker.process_unfinalized_blocks(None, tx).await.unwrap()
        })
        .await;

        assert_eq!(rewind, Some(100));
    }

    #[tokio::test]
    async fn deep_gap_jumps_instead_of_walking() {
        let store = Arc::new(MemoryMetadataStore::new());

        // Record at 100, finalized at 400: gap 300 > PARENT_WALK_LIMIT.
        let canonical_100 = header(100, 0xAA, 0x99);
        let finalized = header(400, 0xF4, 0xF3);
        let headers = Arc::new(MockHeaders::with_chain(vec![
            canonical_100,
            finalized.clone(),
        ]));
        let tracker = UnfinalizedBlocks::new(store.clone(), headers.clone());

        let tx = store.begin().await.unwrap();
        tracker
            .register_unfinalized(100, B256::from([0xAA; 32]), tx)
            .await
            .unwrap();
        tracker.register_finalized(finalized).await;
        let rewind = tracker.process_unfinalized_blocks(None, tx).await.unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(rewind, None, "hash matches canon, no fork");
        // The gap was resolved with one height lookup, no parent walk.
        assert_eq!(headers.height_calls.load(Ordering::SeqCst), 1);
        assert_eq!(headers.hash_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn records_round_trip_through_encoding() {
        let records = vec![
            (100, B256::from([0xAA; 32])),
            (101, B256::from([0xBB; 32])),
            (102, B256::from([0xCC; 32])),
        ];
        let encoded = encode_records(&records).unwrap();
        assert_eq!(decode_records(&encoded).unwrap(), records);
    }

    #[tokio::test]
    async fn cold_start_replays_and_reindexes() {
        let store = Arc::new(MemoryMetadataStore::new());

        // Persist records from a previous run.
        let tx = store.begin().await.unwrap();
        store
            .upsert(
                keys::UNFINALIZED_BLOCKS,
                &encode_records(&[(100, B256::from([0xAA; 32])), (101, B256::from([0xBB; 32]))])
                    .unwrap(),
                tx,
            )
            .await
            .unwrap();
        store
            .upsert(keys::LAST_FINALIZED_VERIFIED, "99", tx)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        // The chain moved on without us: both records are dead.
        let canonical_100 = header(100, 0xA1, 0x99);
        let canonical_101 = header(101, 0xB1, 0xA1);
        let headers = MockHeaders::with_chain(vec![canonical_100, canonical_101.clone()]);
        let tracker = UnfinalizedBlocks::new(store.clone(), Arc::new(headers));

        let rewind = tracker.init(canonical_101).await.unwrap();

        assert_eq!(rewind, Some(99));
        assert_eq!(store.reindex_targets(), vec![99]);
    }

    #[tokio::test]
    async fn cold_start_with_clean_state_is_quiet() {
        let store = Arc::new(MemoryMetadataStore::new());
        let tracker = UnfinalizedBlocks::new(store.clone(), Arc::new(MockHeaders::default()));

        let rewind = tracker.init(header(500, 0x05, 0x04)).await.unwrap();
        assert_eq!(rewind, None);
        assert!(store.reindex_targets().is_empty());
    }
}
