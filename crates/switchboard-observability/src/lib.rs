//! Switchboard Observability
//!
//! This crate provides observability for the routing engine:
//! - Tracing subscriber setup (plain text or JSON)
//! - Prometheus metrics for routing decisions and instance health

pub mod logging;
pub mod metrics;

pub use logging::{LoggingConfig, LoggingError, init_logging};
pub use metrics::RoutingMetrics;
