//! Metadata-store port.
//!
//! The relational store is an external collaborator; this port is the whole
//! contract the indexing core holds it to: key/value text metadata, opaque
//! transactions, and a reindex callback that rewinds durable state.
//!
//! # Atomicity
//!
//! Every state transition that touches multiple keys happens inside one
//! transaction, and a reindex issued inside a transaction must be atomic
//! with that transaction's upserts.

use async_trait::async_trait;

use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// METADATA KEYS
// ═══════════════════════════════════════════════════════════════════════════════

/// Well-known metadata keys.
pub mod keys {
    /// JSON array of `[height, hash]` pairs above the finalized tip.
    pub const UNFINALIZED_BLOCKS: &str = "unfinalizedBlocks";
    /// Greatest finalized height verified against the unfinalized records.
    pub const LAST_FINALIZED_VERIFIED: &str = "lastFinalizedVerifiedHeight";
    /// Greatest committed block height.
    pub const LAST_PROCESSED: &str = "lastProcessedHeight";
    /// Genesis hash of the indexed chain.
    pub const GENESIS_HASH: &str = "genesisHash";
    /// Chain id of the indexed chain.
    pub const CHAIN: &str = "chain";
    /// Runtime/spec name of the indexed chain.
    pub const SPEC_NAME: &str = "specName";
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTION HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque transaction handle issued by [`MetadataStore::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreTx(u64);

impl StoreTx {
    /// Wrap a store-assigned transaction id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The store-assigned id.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// METADATA STORE PORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Port for metadata persistence.
///
/// # Implementation Notes
///
/// Implementations should:
/// - Make [`commit`](Self::commit) apply a transaction's upserts and reindex
///   atomically
/// - Serve [`read`](Self::read) from committed state only
/// - Tolerate [`rollback`](Self::rollback) of never-used transactions
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot open a transaction.
    async fn begin(&self) -> Result<StoreTx>;

    /// Upsert a key inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown transactions or storage failures.
    async fn upsert(&self, key: &str, value: &str, tx: StoreTx) -> Result<()>;

    /// Read a committed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage read fails.
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Request a rewind of all height-scoped durable state above
    /// `target_height`, atomic with this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown transactions or storage failures.
    async fn reindex(&self, target_height: u64, tx: StoreTx) -> Result<()>;

    /// Commit a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit cannot be applied; the transaction is
    /// consumed either way.
    async fn commit(&self, tx: StoreTx) -> Result<()>;

    /// Discard a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot release the transaction.
    async fn rollback(&self, tx: StoreTx) -> Result<()>;
}
