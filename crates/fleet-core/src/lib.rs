//! fleet-core: configuration shared by the fleet daemon and its tools.

pub mod config;

pub use config::{
    ApiConfig, FleetConfig, LogFormat, LoggingConfig, PartitionConfig, ServerConfig, StorageConfig,
};
