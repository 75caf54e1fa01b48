//! Chain-access ports consumed by the indexing core.
//!
//! The fetch service, dispatcher, and unfinalized tracker each need a thin
//! slice of chain access. Keeping the slices separate keeps every component
//! mockable with a handful of lines.

use alloy::primitives::B256;
use async_trait::async_trait;
use chain_api::ChainApi;
use chain_api::types::{BlockHeader, FetchedBlock};

use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// PORTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Header lookups needed for fork detection.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// Canonical header at a height.
    ///
    /// # Errors
    ///
    /// Returns an error when the chain does not have the height.
    async fn header_by_height(&self, height: u64) -> Result<BlockHeader>;

    /// Header with a specific hash, canonical or not.
    ///
    /// # Errors
    ///
    /// Returns an error when no endpoint knows the hash.
    async fn header_by_hash(&self, hash: B256) -> Result<BlockHeader>;
}

/// Chain-tip access needed by the fetch service.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Header of the finalized tip.
    ///
    /// # Errors
    ///
    /// Returns the underlying chain-access error.
    async fn finalized_header(&self) -> Result<BlockHeader>;

    /// Height of the best (unfinalized) tip.
    ///
    /// # Errors
    ///
    /// Returns the underlying chain-access error.
    async fn best_height(&self) -> Result<u64>;
}

/// Full-block fetching needed by dispatcher workers.
#[async_trait]
pub trait BlockLoader: Send + Sync {
    /// Fetch a fully assembled block (header + tx bodies + logs).
    ///
    /// # Errors
    ///
    /// Returns the underlying chain-access error.
    async fn load_block(&self, height: u64) -> Result<FetchedBlock>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN API ADAPTERS
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl HeaderSource for ChainApi {
    async fn header_by_height(&self, height: u64) -> Result<BlockHeader> {
        Ok(self.get_block_by_height_or_hash(height).await?.header)
    }

    async fn header_by_hash(&self, hash: B256) -> Result<BlockHeader> {
        Ok(self.get_block_by_height_or_hash(hash).await?.header)
    }
}

#[async_trait]
impl ChainSource for ChainApi {
    async fn finalized_header(&self) -> Result<BlockHeader> {
        let height = self.get_finalized_block_height().await?;
        Ok(self.get_block_by_height_or_hash(height).await?.header)
    }

    async fn best_height(&self) -> Result<u64> {
        Ok(self.get_best_block_height().await?)
    }
}

#[async_trait]
impl BlockLoader for ChainApi {
    async fn load_block(&self, height: u64) -> Result<FetchedBlock> {
        Ok(self.fetch_block(height, true).await?)
    }
}
