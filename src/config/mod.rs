//! Configuration
//!
//! `AppConfig` is assembled from an optional TOML file plus CLI
//! overrides and kept in a lock-free [`ConfigStore`].

mod schema;
mod store;

pub use schema::{
    AppConfig, DeviceConfig, QualityTier, ServerConfig, SessionConfig, StreamConfig,
    StreamingMode,
};
pub use store::ConfigStore;
