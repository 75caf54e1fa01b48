//! Chain Abstraction Layer
//! ═══════════════════════════════════════════════════════════════════════════════
//! Ethereum semantics over the batched JSON-RPC client.
//!
//! This crate provides:
//!   - [`ConnectionPool`] - health-tracked multiplexing over several endpoints
//!     with chain-identity verification at join time
//!   - [`ChainApi`] - the facade the indexing core consumes: heights (with a
//!     pre-merge finality fallback), blocks, logs, and memoized receipts
//!   - [`types`] - structured block/transaction/log/receipt records
//!   - [`abi`] - a process-wide ABI decode cache and signature hashing
//!
//! # Example
//!
//! ```ignore
//! use chain_api::{ChainApi, ConnectionPool};
//! use eth_rpc::ClientConfig;
//! use std::sync::Arc;
//!
//! let pool = ConnectionPool::connect(
//!     vec!["https://eth.example.org/rpc".into()],
//!     ClientConfig::default(),
//! )
//! .await?;
//!
//! let api = ChainApi::new(Arc::new(pool));
//! let finalized = api.get_finalized_block_height().await?;
//! let block = api.fetch_block(finalized, true).await?;
//! ```

pub mod abi;
mod api;
mod connection;
mod error;
mod pool;
#[cfg(test)]
mod test_support;
pub mod types;

pub use api::{ChainApi, FINALIZED_FALLBACK_DEPTH};
pub use connection::Connection;
pub use error::{ChainApiError, Result};
pub use pool::{ConnectionPool, MAX_RECONNECT_ATTEMPTS};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
