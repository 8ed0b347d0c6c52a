//! Remote record fetcher
//!
//! Fans out one lookup per configured sub-record type, each bounded by its own
//! timeout, and collects whatever succeeds. A failing type never aborts the
//! others. Only when every type fails does the fetcher report `FetchFailed`.
//! There are no retries here.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{IngestError, IngestResult};
use crate::source::{RecordSource, SourceError, SubRecordQuery};

/// Result of one sub-record query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FetchResult {
    Records { records: Vec<Value> },
    Empty,
    Failed { reason: String },
}

/// Per-type outcome, transient and consumed by the builder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome {
    pub record_type: String,
    #[serde(flatten)]
    pub result: FetchResult,
    pub elapsed_ms: u64,
}

impl FetchOutcome {
    pub fn records(record_type: impl Into<String>, records: Vec<Value>) -> Self {
        let result = if records.is_empty() {
            FetchResult::Empty
        } else {
            FetchResult::Records { records }
        };
        Self {
            record_type: record_type.into(),
            result,
            elapsed_ms: 0,
        }
    }

    pub fn failed(record_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            result: FetchResult::Failed {
                reason: reason.into(),
            },
            elapsed_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.result, FetchResult::Failed { .. })
    }
}

/// Outcomes for all configured types, in query-declaration order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchReport {
    pub entity_key: String,
    pub outcomes: Vec<FetchOutcome>,
}

impl FetchReport {
    /// Types whose query failed (a partial fetch when non-empty)
    pub fn failed_types(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.is_failed())
            .map(|o| o.record_type.clone())
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match &o.result {
                FetchResult::Records { records } => records.len(),
                _ => 0,
            })
            .sum()
    }
}

/// Concurrent, failure-isolating fetcher over a [`RecordSource`]
#[derive(Clone)]
pub struct RecordFetcher {
    source: Arc<dyn RecordSource>,
    queries: Vec<SubRecordQuery>,
    timeout: Duration,
}

impl RecordFetcher {
    pub fn new(source: Arc<dyn RecordSource>, queries: Vec<SubRecordQuery>, timeout: Duration) -> Self {
        Self {
            source,
            queries,
            timeout,
        }
    }

    pub fn queries(&self) -> &[SubRecordQuery] {
        &self.queries
    }

    /// Fetch every configured type for `entity_key`
    ///
    /// Cancelling `cancel` drops all in-flight lookups and returns
    /// [`IngestError::Cancelled`].
    pub async fn fetch(&self, entity_key: &str, cancel: &CancellationToken) -> IngestResult<FetchReport> {
        let lookups = self
            .queries
            .iter()
            .map(|query| self.fetch_one(entity_key, query));

        let outcomes = tokio::select! {
            outcomes = join_all(lookups) => outcomes,
            _ = cancel.cancelled() => {
                info!(entity_key = %entity_key, "Fetch cancelled, dropping in-flight sub-queries");
                return Err(IngestError::Cancelled);
            }
        };

        let report = FetchReport {
            entity_key: entity_key.to_string(),
            outcomes,
        };

        let failed = report.failed_types();
        if failed.len() == report.outcomes.len() {
            let reasons = report
                .outcomes
                .iter()
                .filter_map(|o| match &o.result {
                    FetchResult::Failed { reason } => Some(format!("{}: {}", o.record_type, reason)),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(IngestError::FetchFailed {
                attempted: report.outcomes.len(),
                reasons,
            });
        }

        if !failed.is_empty() {
            warn!(
                entity_key = %entity_key,
                failed_types = ?failed,
                "Partial fetch - continuing with available sub-records"
            );
        }

        Ok(report)
    }

    async fn fetch_one(&self, entity_key: &str, query: &SubRecordQuery) -> FetchOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.source.fetch(entity_key, query)).await {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SourceError::Timeout(self.timeout)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut outcome = match result {
            Ok(records) => {
                debug!(
                    entity_key = %entity_key,
                    record_type = %query.record_type,
                    count = records.len(),
                    elapsed_ms,
                    "Sub-query completed"
                );
                FetchOutcome::records(query.record_type.clone(), records)
            },
            Err(e) => {
                warn!(
                    entity_key = %entity_key,
                    record_type = %query.record_type,
                    error = %e,
                    elapsed_ms,
                    "Sub-query failed"
                );
                FetchOutcome::failed(query.record_type.clone(), e.to_string())
            },
        };
        outcome.elapsed_ms = elapsed_ms;
        outcome
    }
}
