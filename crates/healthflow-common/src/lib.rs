//! HealthFlow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the HealthFlow ingestion services.
//!
//! # Overview
//!
//! This crate provides common functionality used across all HealthFlow workspace members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Fingerprints**: Content digests used for aggregate deduplication
//! - **Logging**: Centralized `tracing` subscriber setup
//! - **Types**: Aggregates, ingestion outcomes and batch reports
//!
//! # Example
//!
//! ```no_run
//! use healthflow_common::fingerprint::Fingerprint;
//!
//! let payload = br#"{"resourceType":"Bundle"}"#;
//! let fingerprint = Fingerprint::of(payload);
//! println!("payload fingerprint: {}", fingerprint);
//! ```

pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{HealthflowError, Result};
pub use fingerprint::Fingerprint;
pub use types::{
    Aggregate, BatchReport, BatchSummary, IngestionOutcome, IngestionStatus, NewAggregate,
};
