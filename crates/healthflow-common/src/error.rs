//! Error types for HealthFlow

use thiserror::Error;

/// Result type alias for HealthFlow operations
pub type Result<T> = std::result::Result<T, HealthflowError>;

/// Main error type for HealthFlow
#[derive(Error, Debug)]
pub enum HealthflowError {
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Invalid ingestion status: {0}")]
    InvalidStatus(String),
}
