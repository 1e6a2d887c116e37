//! File-based configuration for switchboard
//!
//! Loads a gateway configuration (providers, router, instance groups,
//! logging) from YAML, TOML or JSON, migrating slot-based router sections
//! on the way, and watches the file for changes.

pub mod file_source;
pub mod gateway;

pub use file_source::{ConfigChange, ConfigChangeStream, FileConfigSource};
pub use gateway::{GatewayConfig, GroupConfig};
