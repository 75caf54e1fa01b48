//! Ports: the traits the indexing core holds its collaborators to.
//!
//! Infrastructure adapters implement these; everything inside the core is
//! written against the traits so each component tests with a few lines of
//! mock.

mod chain;
mod handler;
mod store;

pub use chain::{BlockLoader, ChainSource, HeaderSource};
pub use handler::{BlockConsumer, ProcessOutcome};
pub use store::{MetadataStore, StoreTx, keys};
