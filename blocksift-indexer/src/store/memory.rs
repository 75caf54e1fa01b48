//! In-memory metadata store.
//!
//! Backs tests and the default binary wiring. The relational adapter lives
//! outside this crate; this one exists so the core is runnable and testable
//! without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{IndexerError, Result};
use crate::ports::{MetadataStore, StoreTx};

/// A buffered operation awaiting commit.
#[derive(Debug, Clone)]
enum PendingOp {
    Upsert(String, String),
    Reindex(u64),
}

/// Metadata store held entirely in memory.
///
/// Transactions buffer their operations and apply them atomically at commit
/// under one lock, which satisfies the port's atomicity contract trivially.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    /// Committed key/value state.
    committed: Mutex<HashMap<String, String>>,
    /// Open transactions and their buffered operations.
    pending: Mutex<HashMap<u64, Vec<PendingOp>>>,
    /// Transaction id counter.
    next_tx: AtomicU64,
    /// Reindex targets applied so far, in commit order.
    reindex_targets: Mutex<Vec<u64>>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value for a key, without going through the async port.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.committed.lock().get(key).cloned()
    }

    /// Reindex targets committed so far, in order.
    #[must_use]
    pub fn reindex_targets(&self) -> Vec<u64> {
        self.reindex_targets.lock().clone()
    }

    fn take_pending(&self, tx: StoreTx) -> Result<Vec<PendingOp>> {
        self.pending
            .lock()
            .remove(&tx.id())
            .ok_or_else(|| IndexerError::Store(format!("unknown transaction {}", tx.id())))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn begin(&self) -> Result<StoreTx> {
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, Vec::new());
        Ok(StoreTx::new(id))
    }

    async fn upsert(&self, key: &str, value: &str, tx: StoreTx) -> Result<()> {
        let mut pending = self.pending.lock();
        let ops = pending
            .get_mut(&tx.id())
            .ok_or_else(|| IndexerError::Store(format!("unknown transaction {}", tx.id())))?;
        ops.push(PendingOp::Upsert(key.to_string(), value.to_string()));
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.committed.lock().get(key).cloned())
    }

    async fn reindex(&self, target_height: u64, tx: StoreTx) -> Result<()> {
        let mut pending = self.pending.lock();
        let ops = pending
            .get_mut(&tx.id())
            .ok_or_else(|| IndexerError::Store(format!("unknown transaction {}", tx.id())))?;
        ops.push(PendingOp::Reindex(target_height));
        Ok(())
    }

    async fn commit(&self, tx: StoreTx) -> Result<()> {
        let ops = self.take_pending(tx)?;

        // One lock scope = atomic application.
        let mut committed = self.committed.lock();
        for op in ops {
            match op {
                PendingOp::Upsert(key, value) => {
                    committed.insert(key, value);
                }
                PendingOp::Reindex(target) => {
                    debug!(target, "memory store reindex");
                    self.reindex_targets.lock().push(target);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: StoreTx) -> Result<()> {
        self.take_pending(tx)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
