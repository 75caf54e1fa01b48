//! Worker-boundary contract with the user-handler sandbox.
//!
//! Handler execution is an external collaborator; the dispatcher only knows
//! this message contract. Everything crossing the boundary is an owned
//! value, so the in-process implementation can later be replaced by a
//! process boundary without touching the dispatcher.

use alloy::primitives::B256;
use async_trait::async_trait;
use chain_api::types::FetchedBlock;

use crate::error::Result;
use crate::types::DataSource;

/// What came back from running the handler set over one block.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Parent hash of the processed block, echoed for reorg bookkeeping.
    pub parent_hash: B256,
    /// Data sources created dynamically by handlers during this block.
    pub dynamic_data_sources: Vec<DataSource>,
}

/// Port for the user-handler sandbox.
#[async_trait]
pub trait BlockConsumer: Send + Sync {
    /// Run the active handler set over a block.
    ///
    /// The block and the data-source list are passed by value-semantics
    /// (cloned or serialized); the sandbox never receives live handles.
    ///
    /// # Errors
    ///
    /// A returned error means the handlers could not process the block.
    /// The dispatcher retries internally, then treats it as fatal: a
    /// height is never skipped.
    async fn process_block(
        &self,
        block: &FetchedBlock,
        data_sources: &[DataSource],
    ) -> Result<ProcessOutcome>;
}
