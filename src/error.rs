//! Error types for forge-core.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for forge-core operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Main error type for forge-core.
#[derive(Error, Debug)]
pub enum ForgeError {
    // Image lifecycle errors
    #[error("Image not found: {image_id}")]
    ImageNotFound { image_id: String },

    #[error("Image already exists: {image_id}")]
    ImageAlreadyExists { image_id: String },

    #[error("Build failed for image {image_id}: {reason}")]
    BuildFailed { image_id: String, reason: String },

    #[error("Upstream build {upstream_id} failed: {reason}")]
    UpstreamFailed { upstream_id: String, reason: String },

    #[error("Build stage timed out after {seconds}s")]
    StageTimeout { seconds: u64 },

    // Delegate errors
    #[error("Delegate hook {hook} failed: {reason}")]
    DelegateFailed { hook: String, reason: String },

    // Plugin errors
    #[error("No plugin found for target: {target}")]
    PluginNotFound { target: String },

    // Storage errors
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // Webhook errors
    #[error("Invalid callback URL {url}: {reason}")]
    InvalidCallbackUrl { url: String, reason: String },

    #[error("Callback delivery failed: {reason}")]
    CallbackDeliveryFailed { reason: String },

    // Resource errors
    #[error("Insufficient resources: {reason}")]
    InsufficientResources { reason: String },

    #[error("No reservation recorded for file: {path:?}")]
    ReservationNotFound { path: PathBuf },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}
