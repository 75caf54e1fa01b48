//! blocksift indexing core
//!
//! An Ethereum-family block indexer core: it pulls blocks from a pool of
//! JSON-RPC endpoints, accelerates historical catch-up through an external
//! "dictionary" pre-filter service, dispatches matching blocks to handler
//! workers in strict height order, and recovers from chain reorganizations
//! affecting unfinalized blocks.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          INDEXER CORE                              │
//! │                                                                    │
//! │  ┌────────────┐    ┌──────────────┐    ┌────────────────────────┐  │
//! │  │   Fetch    │───▶│  Dispatcher  │───▶│  Workers → Committer   │  │
//! │  │  Service   │    │ (bounded Q)  │    │  (in-order commits)    │  │
//! │  └─────┬──────┘    └──────────────┘    └───────────┬────────────┘  │
//! │        │                                           │               │
//! │  ┌─────▼──────┐    ┌──────────────┐    ┌───────────▼────────────┐  │
//! │  │ Dictionary │    │  Chain API   │    │  Unfinalized Tracker   │  │
//! │  │  (v1/v2)   │    │ (pool + RPC) │    │   (fork detection)     │  │
//! │  └────────────┘    └──────────────┘    └────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`types`] - data sources, handlers, the block-height map
//! - [`error`] - layered error types
//! - [`config`] - configuration loading and validation
//! - [`ports`] - traits the core holds its collaborators to
//! - [`store`] - metadata-store adapters
//! - [`dictionary`] - v1/v2 dictionary clients and query construction
//! - [`indexer`] - fetch service, dispatcher, unfinalized tracker, wiring

pub mod config;
pub mod dictionary;
pub mod error;
pub mod indexer;
pub mod ports;
pub mod store;
pub mod types;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string
#[must_use]
pub const fn version() -> &'static str {
    VERSION
}
