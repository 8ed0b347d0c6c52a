//! Remote record sources
//!
//! A source answers one query per sub-record type for a given entity key.
//! Each answer is zero or more loosely-typed JSON documents; the pipeline
//! never interprets them beyond checking they are JSON objects.

pub mod fhir;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fhir::FhirRecordSource;

/// Result type for source lookups
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Error types for a single remote lookup
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),
}

/// How a sub-record type is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Direct read of the entity itself (`GET /{type}/{key}`)
    Read,
    /// Search for records that reference the entity as their subject
    SubjectSearch,
}

/// One entry of the ordered query list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRecordQuery {
    /// Sub-record type tag, e.g. `Observation`
    pub record_type: String,
    pub kind: QueryKind,
    /// Maximum number of records requested
    pub limit: u32,
}

impl SubRecordQuery {
    pub fn read(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            kind: QueryKind::Read,
            limit: 1,
        }
    }

    pub fn subject_search(record_type: impl Into<String>, limit: u32) -> Self {
        Self {
            record_type: record_type.into(),
            kind: QueryKind::SubjectSearch,
            limit,
        }
    }
}

/// The patient-centric query list, in the order sub-records appear in the aggregate
pub fn default_queries() -> Vec<SubRecordQuery> {
    vec![
        SubRecordQuery::read("Patient"),
        SubRecordQuery::subject_search("Observation", 100),
        SubRecordQuery::subject_search("Condition", 50),
        SubRecordQuery::subject_search("MedicationRequest", 50),
        SubRecordQuery::subject_search("DiagnosticReport", 30),
    ]
}

/// Query-per-type read API keyed by entity key
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch all records of `query.record_type` for `entity_key`
    ///
    /// An entity with no records of this type yields `Ok(vec![])`.
    async fn fetch(
        &self,
        entity_key: &str,
        query: &SubRecordQuery,
    ) -> SourceResult<Vec<serde_json::Value>>;

    /// Short human-readable connectivity report
    async fn status(&self) -> String {
        "status unavailable".to_string()
    }
}
