//! Storage adapters for the metadata-store port.

mod memory;

pub use memory::MemoryMetadataStore;
