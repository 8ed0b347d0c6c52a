//! Pipeline-level error types

use thiserror::Error;

use crate::publisher::PublishError;
use crate::store::StoreError;

/// Result type alias for pipeline operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Failure that ends an ingestion run (or a whole batch request)
///
/// Partial fetches and duplicates are not errors; they are regular outcomes.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Every configured sub-query failed; retry the whole ingestion later
    #[error("FetchFailed: all {attempted} sub-queries failed ({reasons})")]
    FetchFailed { attempted: usize, reasons: String },

    /// The store rejected the write; nothing was committed
    #[error("StorageFailure: {0}")]
    Storage(#[from] StoreError),

    /// The aggregate is stored but the notification did not reach the broker
    #[error("PublishFailed: {0}")]
    Publish(#[from] PublishError),

    /// The run was cancelled before anything was persisted
    #[error("Cancelled: ingestion aborted before persisting")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),
}

impl IngestError {
    /// Short tag used in logs and audit records
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::FetchFailed { .. } => "fetch_failed",
            IngestError::Storage(_) => "storage_failure",
            IngestError::Publish(_) => "publish_failed",
            IngestError::Cancelled => "cancelled",
            IngestError::Validation(_) => "validation",
        }
    }
}
