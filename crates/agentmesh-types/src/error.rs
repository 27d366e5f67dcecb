//! Shared error types for agentmesh.

use thiserror::Error;

/// Top-level error type for the agentmesh system.
///
/// Delivery and registry operations report misses through `bool`/`Option`
/// returns; this type covers the fallible edges (config, serialization, I/O).
#[derive(Error, Debug)]
pub enum MeshError {
    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A subscriber callback returned an error or panicked.
    #[error("Handler failed for subscription {subscription}: {reason}")]
    Handler {
        /// The failing subscription.
        subscription: String,
        /// Why it failed.
        reason: String,
    },

    /// The component has not been started.
    #[error("Component not running: {0}")]
    NotRunning(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Alias for Result with MeshError.
pub type MeshResult<T> = Result<T, MeshError>;
