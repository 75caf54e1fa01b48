//! The indexing core: fetch loop, dispatcher, and reorg tracking.
//!
//! - [`fetcher`] - the single driver loop computing batches of heights
//! - [`dispatcher`] - bounded queue, worker pool, in-order commit
//! - [`unfinalized`] - unfinalized-block tracking and fork recovery
//! - [`service`] - wiring of the above into a runnable indexer

pub mod dispatcher;
pub mod fetcher;
pub mod service;
pub mod unfinalized;
mod worker;

pub use dispatcher::{BlockDispatcher, BlockSink, DispatcherConfig, DispatcherEvent};
pub use fetcher::{FetchConfig, FetchService};
pub use service::IndexerService;
pub use unfinalized::UnfinalizedBlocks;
