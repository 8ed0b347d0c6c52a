//! Ingestion pipeline orchestrator
//!
//! One run moves through
//! `Fetching → Building → Fingerprinting → CheckingDuplicate`, then either
//! stops at `Duplicate` or continues `Persisting → Publishing → Done`. Any
//! error ends the run in `Failed`.
//!
//! Cancellation is honoured up to `Persisting`. From there on the run always
//! completes so a stored aggregate is never left without its notification
//! attempt.
//!
//! Audit records are sent from background tasks and never delay the returned
//! outcome. Call [`IngestionPipeline::flush_audits`] before shutdown to let
//! the pending ones finish.

use healthflow_common::{BatchReport, IngestionOutcome};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::builder::AggregateBuilder;
use crate::error::{IngestError, IngestResult};
use crate::fetcher::RecordFetcher;
use crate::locks::EntityLocks;
use crate::publisher::{AuditEvent, IngestionNotifier};
use crate::store::AggregateStore;

/// Operation name recorded in audit events
pub const AUDIT_OPERATION: &str = "sync_patient";

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Fetching,
    Building,
    Fingerprinting,
    CheckingDuplicate,
    Duplicate,
    Persisting,
    Publishing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Duplicate | PipelineState::Done | PipelineState::Failed)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Fetching => "fetching",
            PipelineState::Building => "building",
            PipelineState::Fingerprinting => "fingerprinting",
            PipelineState::CheckingDuplicate => "checking_duplicate",
            PipelineState::Duplicate => "duplicate",
            PipelineState::Persisting => "persisting",
            PipelineState::Publishing => "publishing",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks and traces the state of one run
struct Run<'a> {
    entity_key: &'a str,
    state: PipelineState,
}

impl<'a> Run<'a> {
    fn start(entity_key: &'a str) -> Self {
        debug!(entity_key = %entity_key, state = %PipelineState::Fetching, "Ingestion run started");
        Self {
            entity_key,
            state: PipelineState::Fetching,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!(
            entity_key = %self.entity_key,
            from = %self.state,
            to = %next,
            "Pipeline transition"
        );
        self.state = next;
    }
}

/// Coordinates fetcher, builder, store and notifier for each entity key
pub struct IngestionPipeline {
    fetcher: RecordFetcher,
    builder: AggregateBuilder,
    store: Arc<dyn AggregateStore>,
    notifier: IngestionNotifier,
    locks: Option<EntityLocks>,
    audit_enabled: bool,
    audits: TaskTracker,
}

impl IngestionPipeline {
    /// Create a pipeline with per-entity serialization and auditing enabled
    pub fn new(
        fetcher: RecordFetcher,
        builder: AggregateBuilder,
        store: Arc<dyn AggregateStore>,
        notifier: IngestionNotifier,
    ) -> Self {
        Self {
            fetcher,
            builder,
            store,
            notifier,
            locks: Some(EntityLocks::new()),
            audit_enabled: true,
            audits: TaskTracker::new(),
        }
    }

    /// Toggle the per-entity lock around whole runs
    pub fn with_serialize_per_entity(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(EntityLocks::new);
        self
    }

    pub fn with_audit(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Wait for every audit record handed off so far
    pub async fn flush_audits(&self) {
        self.audits.close();
        self.audits.wait().await;
        self.audits.reopen();
    }

    /// Run one ingestion for `entity_key`
    ///
    /// Never returns an error: every failure is folded into a `failed`
    /// outcome whose reason starts with the failure kind.
    pub async fn ingest(&self, entity_key: &str, cancel: &CancellationToken) -> IngestionOutcome {
        let started = Instant::now();

        let outcome = match self.run_exclusive(entity_key, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(
                    entity_key = %entity_key,
                    to = %PipelineState::Failed,
                    kind = e.kind(),
                    "Pipeline transition"
                );
                match &e {
                    IngestError::Cancelled => info!(entity_key = %entity_key, "Ingestion cancelled"),
                    _ => error!(entity_key = %entity_key, error = %e, "Ingestion failed"),
                }
                IngestionOutcome::failed(entity_key, e.to_string())
            },
        };

        self.record_audit(&outcome, started.elapsed());
        outcome
    }

    /// Ingest each key in turn; keys are independent of each other
    ///
    /// Once `cancel` fires, the remaining keys are reported as cancelled
    /// without being fetched.
    pub async fn ingest_batch(
        &self,
        entity_keys: &[String],
        cancel: &CancellationToken,
    ) -> IngestResult<BatchReport> {
        if entity_keys.is_empty() {
            return Err(IngestError::Validation("entity key list is required".to_string()));
        }

        info!(total = entity_keys.len(), "Starting batch ingestion");
        let mut report = BatchReport::default();

        for entity_key in entity_keys {
            let outcome = if cancel.is_cancelled() {
                IngestionOutcome::failed(entity_key.as_str(), IngestError::Cancelled.to_string())
            } else {
                self.ingest(entity_key, cancel).await
            };
            report.push(outcome);
        }

        info!(
            total = report.summary.total,
            created = report.summary.created,
            duplicate = report.summary.duplicate,
            failed = report.summary.failed,
            "Batch ingestion completed"
        );

        Ok(report)
    }

    async fn run_exclusive(
        &self,
        entity_key: &str,
        cancel: &CancellationToken,
    ) -> IngestResult<IngestionOutcome> {
        if entity_key.trim().is_empty() {
            return Err(IngestError::Validation("entity key cannot be empty".to_string()));
        }

        let _guard = match &self.locks {
            Some(locks) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                guard = locks.acquire(entity_key) => Some(guard),
            },
            None => None,
        };

        self.run(entity_key, cancel).await
    }

    async fn run(&self, entity_key: &str, cancel: &CancellationToken) -> IngestResult<IngestionOutcome> {
        let mut run = Run::start(entity_key);

        let report = self.fetcher.fetch(entity_key, cancel).await?;
        let partial_failures = report.failed_types();

        run.advance(PipelineState::Building);
        let built = self.builder.build(&report);

        run.advance(PipelineState::Fingerprinting);
        let fingerprint = built.aggregate.fingerprint.clone();
        debug!(entity_key = %entity_key, fingerprint = %fingerprint, "Payload fingerprinted");

        run.advance(PipelineState::CheckingDuplicate);
        let exists = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            exists = self.store.exists_by_fingerprint(&fingerprint) => exists?,
        };

        if exists {
            run.advance(PipelineState::Duplicate);
            info!(entity_key = %entity_key, fingerprint = %fingerprint, "Duplicate aggregate, skipping");
            return Ok(IngestionOutcome::duplicate(entity_key, fingerprint)
                .with_partial_failures(partial_failures));
        }

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        run.advance(PipelineState::Persisting);
        let aggregate = self.store.save(built.aggregate).await?;
        info!(
            entity_key = %entity_key,
            aggregate_id = %aggregate.id,
            entries = built.entry_count,
            "Stored new aggregate"
        );

        run.advance(PipelineState::Publishing);
        let mut outcome = IngestionOutcome::created(&aggregate).with_partial_failures(partial_failures);
        if let Err(e) = self.notifier.aggregate_stored(&aggregate).await {
            let e = IngestError::from(e);
            warn!(
                entity_key = %entity_key,
                aggregate_id = %aggregate.id,
                error = %e,
                "Aggregate stored but notification failed"
            );
            outcome = outcome.with_publish_failure(e.to_string());
        }

        run.advance(PipelineState::Done);
        Ok(outcome)
    }

    fn record_audit(&self, outcome: &IngestionOutcome, elapsed: Duration) {
        let duration_ms = elapsed.as_millis() as u64;

        info!(
            target: "audit",
            operation = AUDIT_OPERATION,
            entity_key = %outcome.entity_key,
            status = %outcome.status,
            duration_ms,
            publish_failed = outcome.publish_failed,
            "Ingestion run finished"
        );

        if !self.audit_enabled {
            return;
        }

        let metadata = json!({
            "status": outcome.status,
            "durationMs": duration_ms,
            "aggregateId": outcome.aggregate_id,
            "publishFailed": outcome.publish_failed,
            "fetchFailures": outcome.partial_failures,
            "error": outcome.error,
        });

        let event = AuditEvent::new(AUDIT_OPERATION, outcome.entity_key.as_str(), metadata);
        let notifier = self.notifier.clone();
        self.audits.spawn(async move {
            notifier.audit(event).await;
        });
    }
}
