//! Switchboard Core Types
//!
//! This crate provides the fundamental types shared by the switchboard crates:
//! - Request model consumed by the routing engine
//! - Provider catalog used for provider/model resolution
//! - Core error types

pub mod error;
pub mod provider;
pub mod request;

pub use error::{Error, Result};
pub use provider::{ProviderCatalog, ProviderEntry, ROUTE_SEPARATOR, split_route};
pub use request::{
    ContentBlock, Message, MessageContent, RouteRequest, SystemBlock, Tool, ToolFunction, is_truthy,
};
