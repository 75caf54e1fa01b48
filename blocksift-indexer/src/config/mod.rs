//! Configuration loading and validation.

mod settings;

pub use settings::{
    IndexerSettings, LoggingSettings, MetricsSettings, NetworkSettings, Settings,
};
