//! Common types used across HealthFlow

use crate::error::HealthflowError;
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type tag used when no other shape is configured
pub const DEFAULT_AGGREGATE_TYPE: &str = "Patient";

// ============================================================================
// Aggregates
// ============================================================================

/// Canonical assembled record for one entity at one point in time.
///
/// Aggregates are append-only: once stored, only `updated_at` may change.
/// Several aggregates may exist for the same `entity_key` (history is kept),
/// but at most one is expected per `fingerprint`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Aggregate {
    /// Generated at creation, immutable
    pub id: Uuid,

    /// External identifier the aggregate was built for (e.g. a patient id)
    pub entity_key: String,

    /// Shape tag, `Patient` unless configured otherwise
    pub aggregate_type: String,

    /// Serialized, ordered collection of sub-records
    pub payload: String,

    /// Digest of `payload` at build time
    pub fingerprint: Fingerprint,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An aggregate that has been built and fingerprinted but not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewAggregate {
    pub entity_key: String,
    pub aggregate_type: String,
    pub payload: String,
    pub fingerprint: Fingerprint,
}

impl NewAggregate {
    /// Fingerprint `payload` and wrap it for persistence
    pub fn new(
        entity_key: impl Into<String>,
        aggregate_type: impl Into<String>,
        payload: String,
    ) -> Self {
        let fingerprint = Fingerprint::of(payload.as_bytes());
        Self {
            entity_key: entity_key.into(),
            aggregate_type: aggregate_type.into(),
            payload,
            fingerprint,
        }
    }

    /// Assign identity and timestamps
    pub fn into_aggregate(self, id: Uuid, now: DateTime<Utc>) -> Aggregate {
        Aggregate {
            id,
            entity_key: self.entity_key,
            aggregate_type: self.aggregate_type,
            payload: self.payload,
            fingerprint: self.fingerprint,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Ingestion Outcomes
// ============================================================================

/// Terminal status of one ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    Created,
    Duplicate,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Created => "created",
            IngestionStatus::Duplicate => "duplicate",
            IngestionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IngestionStatus {
    type Err = HealthflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(IngestionStatus::Created),
            "duplicate" => Ok(IngestionStatus::Duplicate),
            "failed" => Ok(IngestionStatus::Failed),
            other => Err(HealthflowError::InvalidStatus(other.to_string())),
        }
    }
}

/// Result of one ingestion run, returned to the caller and never persisted here
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionOutcome {
    pub entity_key: String,
    pub status: IngestionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Set when the aggregate was stored but the notification never reached the broker
    #[serde(default)]
    pub publish_failed: bool,

    /// Sub-record types whose fetch failed but did not stop the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_failures: Vec<String>,

    /// Human-readable reason, present for `failed` runs and publish failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestionOutcome {
    pub fn created(aggregate: &Aggregate) -> Self {
        Self {
            entity_key: aggregate.entity_key.clone(),
            status: IngestionStatus::Created,
            aggregate_id: Some(aggregate.id),
            fingerprint: Some(aggregate.fingerprint.clone()),
            created_at: Some(aggregate.created_at),
            publish_failed: false,
            partial_failures: Vec::new(),
            error: None,
        }
    }

    pub fn duplicate(entity_key: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            entity_key: entity_key.into(),
            status: IngestionStatus::Duplicate,
            aggregate_id: None,
            fingerprint: Some(fingerprint),
            created_at: None,
            publish_failed: false,
            partial_failures: Vec::new(),
            error: None,
        }
    }

    pub fn failed(entity_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            status: IngestionStatus::Failed,
            aggregate_id: None,
            fingerprint: None,
            created_at: None,
            publish_failed: false,
            partial_failures: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn with_partial_failures(mut self, failed_types: Vec<String>) -> Self {
        self.partial_failures = failed_types;
        self
    }

    /// Record that the primary notification failed; the status stays `created`
    pub fn with_publish_failure(mut self, reason: impl Into<String>) -> Self {
        self.publish_failed = true;
        self.error = Some(reason.into());
        self
    }

    pub fn is_created(&self) -> bool {
        self.status == IngestionStatus::Created
    }
}

// ============================================================================
// Batch Results
// ============================================================================

/// Aggregate counts for a batch of ingestion runs
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub created: usize,
    pub duplicate: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn record(&mut self, status: IngestionStatus) {
        self.total += 1;
        match status {
            IngestionStatus::Created => self.created += 1,
            IngestionStatus::Duplicate => self.duplicate += 1,
            IngestionStatus::Failed => self.failed += 1,
        }
    }
}

/// Per-key outcomes plus summary counts; keys are independent, never transactional
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub summary: BatchSummary,
    pub results: Vec<IngestionOutcome>,
}

impl BatchReport {
    pub fn push(&mut self, outcome: IngestionOutcome) {
        self.summary.record(outcome.status);
        self.results.push(outcome);
    }
}

impl FromIterator<IngestionOutcome> for BatchReport {
    fn from_iter<I: IntoIterator<Item = IngestionOutcome>>(iter: I) -> Self {
        let mut report = BatchReport::default();
        for outcome in iter {
            report.push(outcome);
        }
        report
    }
}
