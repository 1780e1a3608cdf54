//! Error types for Keepsake

use std::time::Duration;
use thiserror::Error;

/// Result type alias for Keepsake operations
pub type Result<T> = std::result::Result<T, KeepsakeError>;

/// Main error type for Keepsake
#[derive(Error, Debug)]
pub enum KeepsakeError {
    #[error("Feature disabled: {0}")]
    ConfigDisabled(String),

    #[error("Data collection failed: {0}")]
    Collection(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("No device registered for this installation")]
    DeviceNotRegistered,

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage provider error: {0}")]
    Provider(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeepsakeError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeepsakeError::Storage(_) | KeepsakeError::Provider(_) | KeepsakeError::Timeout(_)
        )
    }

    /// Short machine-readable code, used in history entries and CLI output
    pub fn code(&self) -> &'static str {
        match self {
            KeepsakeError::ConfigDisabled(_) => "config_disabled",
            KeepsakeError::Collection(_) => "collection_failure",
            KeepsakeError::Compression(_) => "compression_failure",
            KeepsakeError::Encryption(_) => "encryption_failure",
            KeepsakeError::Integrity(_) => "integrity_failure",
            KeepsakeError::SyncInProgress => "sync_in_progress",
            KeepsakeError::DeviceNotRegistered => "device_not_registered",
            KeepsakeError::ConflictNotFound(_) => "conflict_not_found",
            KeepsakeError::NotFound(_) => "not_found",
            KeepsakeError::Storage(_) | KeepsakeError::Provider(_) => "storage_failure",
            KeepsakeError::Timeout(_) => "timeout",
            KeepsakeError::Config(_) => "config_error",
            KeepsakeError::InvalidInput(_) => "invalid_input",
            _ => "internal",
        }
    }
}
