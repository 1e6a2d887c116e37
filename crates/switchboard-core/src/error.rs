//! Error types for Switchboard Core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration not found")]
    ConfigNotFound,

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    // Rule evaluation errors
    #[error("Unsupported condition type: {0}")]
    UnsupportedCondition(String),

    #[error("External predicate error: {0}")]
    ExternalPredicate(String),

    // Instance management errors
    #[error("Instance capacity reached: at most {max} instances allowed")]
    CapacityExceeded { max: usize },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
