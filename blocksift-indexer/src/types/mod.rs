//! Domain types for the indexing core.
//!
//! - [`datasource`] - user-supplied data sources, handlers, filters
//! - [`height_map`] - the ordered start-height map driving "active at H?"

pub mod datasource;
pub mod height_map;

pub use datasource::{
    BlockFilter, CallFilter, DataSource, DataSourceOptions, EventFilter, Handler, HandlerKind,
    HandlerSpec, Mapping,
};
pub use height_map::BlockHeightMap;

/// The concrete height map the indexer passes around.
pub type DataSourceMap = BlockHeightMap<DataSource>;

/// Build a [`DataSourceMap`] from a flat list of data sources.
#[must_use]
pub fn build_data_source_map(data_sources: &[DataSource]) -> DataSourceMap {
    BlockHeightMap::new(
        data_sources
            .iter()
            .map(|ds| (ds.start_block, ds.end_block, ds.clone()))
            .collect(),
    )
}
