//! Ingestion pipeline behaviour against in-memory collaborators
//!
//! Covers:
//! 1. created → duplicate → created when the source data changes
//! 2. partial and total fetch failures
//! 3. storage and publish failures
//! 4. batch summaries and cancellation
//! 5. per-entity serialization of concurrent runs, and the relaxed mode
//! 6. audit records sent off the result path

mod common;

use common::{
    build_harness, harness, harness_with_audit_delay, records, HarnessOptions, Script, AUDIT_TOPIC,
    RAW_TOPIC,
};
use healthflow_common::{BatchSummary, IngestionStatus};
use healthflow_ingest::{AggregateStore, IngestError};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn entry_urls(payload: &str) -> Vec<String> {
    let bundle: Value = serde_json::from_str(payload).unwrap();
    bundle["entry"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["fullUrl"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_same_data_is_created_then_duplicate_then_new_on_change() {
    let h = harness(&["A", "B", "C"]);
    h.source.set("E1", "A", Script::Records(records("A", "a", 2)));
    h.source.set("E1", "B", Script::Records(Vec::new()));
    h.source.set("E1", "C", Script::Fail("connection reset".to_string()));
    let cancel = CancellationToken::new();

    let first = h.pipeline.ingest("E1", &cancel).await;
    assert_eq!(first.status, IngestionStatus::Created);
    assert_eq!(first.partial_failures, vec!["C".to_string()]);
    let f1 = first.fingerprint.clone().unwrap();

    let stored = h.store.find_latest_by_entity_key("E1").await.unwrap().unwrap();
    assert_eq!(entry_urls(&stored.payload), vec!["A/a1", "A/a2"]);

    let second = h.pipeline.ingest("E1", &cancel).await;
    assert_eq!(second.status, IngestionStatus::Duplicate);
    assert_eq!(second.fingerprint.as_ref(), Some(&f1));
    assert!(second.aggregate_id.is_none());

    h.source.set("E1", "C", Script::Records(records("C", "c", 1)));
    let third = h.pipeline.ingest("E1", &cancel).await;
    assert_eq!(third.status, IngestionStatus::Created);
    assert_ne!(third.fingerprint.as_ref(), Some(&f1));
    assert!(third.partial_failures.is_empty());

    assert_eq!(h.store.count_by_entity_key("E1").await.unwrap(), 2);
    assert_eq!(h.publisher.events_for(RAW_TOPIC).await.len(), 2);

    let latest = h.store.find_latest_by_entity_key("E1").await.unwrap().unwrap();
    assert_eq!(Some(latest.id), third.aggregate_id);
    assert_eq!(entry_urls(&latest.payload), vec!["A/a1", "A/a2", "C/c1"]);
}

#[tokio::test]
async fn test_one_failed_type_is_omitted_and_run_is_created() {
    let h = harness(&["Patient", "Observation", "Condition"]);
    h.source.set("P1", "Patient", Script::Records(records("Patient", "P", 1)));
    h.source.set("P1", "Observation", Script::Fail("HTTP 503".to_string()));
    h.source.set("P1", "Condition", Script::Records(records("Condition", "c", 2)));

    let outcome = h.pipeline.ingest("P1", &CancellationToken::new()).await;
    assert_eq!(outcome.status, IngestionStatus::Created);
    assert_eq!(outcome.partial_failures, vec!["Observation".to_string()]);

    let stored = h.store.find_latest_by_entity_key("P1").await.unwrap().unwrap();
    assert_eq!(
        entry_urls(&stored.payload),
        vec!["Patient/P1", "Condition/c1", "Condition/c2"]
    );
    assert!(stored.fingerprint.matches(stored.payload.as_bytes()));
}

#[tokio::test]
async fn test_all_types_failing_stores_nothing() {
    let h = harness(&["A", "B", "C"]);
    for record_type in ["A", "B", "C"] {
        h.source.set("E2", record_type, Script::Fail("unreachable".to_string()));
    }

    let outcome = h.pipeline.ingest("E2", &CancellationToken::new()).await;
    assert_eq!(outcome.status, IngestionStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().starts_with("FetchFailed"));

    assert!(h.store.is_empty().await);
    assert_eq!(h.store.save_calls(), 0);
    assert!(h.publisher.events_for(RAW_TOPIC).await.is_empty());
}

#[tokio::test]
async fn test_storage_failure_is_failed_and_not_published() {
    let h = harness(&["A"]);
    h.source.set("E1", "A", Script::Records(records("A", "a", 1)));
    h.store.set_fail_writes(true);

    let outcome = h.pipeline.ingest("E1", &CancellationToken::new()).await;
    assert_eq!(outcome.status, IngestionStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().starts_with("StorageFailure"));
    assert!(h.publisher.events_for(RAW_TOPIC).await.is_empty());

    // nothing was committed, so a retry goes through
    h.store.set_fail_writes(false);
    let retry = h.pipeline.ingest("E1", &CancellationToken::new()).await;
    assert_eq!(retry.status, IngestionStatus::Created);
}

#[tokio::test]
async fn test_publish_failure_keeps_aggregate() {
    let h = harness(&["A"]);
    h.source.set("E1", "A", Script::Records(records("A", "a", 3)));
    h.publisher.fail_topic(RAW_TOPIC).await;

    let outcome = h.pipeline.ingest("E1", &CancellationToken::new()).await;
    assert_eq!(outcome.status, IngestionStatus::Created);
    assert!(outcome.publish_failed);
    assert!(outcome.error.as_deref().unwrap().starts_with("PublishFailed"));

    let latest = h.store.find_latest_by_entity_key("E1").await.unwrap().unwrap();
    assert_eq!(Some(latest.id), outcome.aggregate_id);

    // the stored aggregate makes the next identical run a duplicate
    h.publisher.recover_topic(RAW_TOPIC).await;
    let again = h.pipeline.ingest("E1", &CancellationToken::new()).await;
    assert_eq!(again.status, IngestionStatus::Duplicate);
}

#[tokio::test]
async fn test_event_is_keyed_by_entity() {
    let h = harness(&["A"]);
    h.source.set("E7", "A", Script::Records(records("A", "a", 1)));

    let outcome = h.pipeline.ingest("E7", &CancellationToken::new()).await;

    let events = h.publisher.events_for(RAW_TOPIC).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].partition_key, "E7");
    assert_eq!(events[0].payload["patientId"], "E7");
    assert_eq!(
        events[0].payload["bundleId"],
        outcome.aggregate_id.unwrap().to_string()
    );
    assert_eq!(events[0].payload["eventType"], "fhir_data_ingested");
}

#[tokio::test]
async fn test_audit_event_follows_every_run() {
    let h = harness(&["A"]);
    h.source.set("E1", "A", Script::Records(records("A", "a", 1)));
    let cancel = CancellationToken::new();

    h.pipeline.ingest("E1", &cancel).await;
    h.pipeline.ingest("E1", &cancel).await;
    h.pipeline.flush_audits().await;

    let audits = h.publisher.events_for(AUDIT_TOPIC).await;
    assert_eq!(audits.len(), 2);
    assert!(audits.iter().all(|a| a.payload["operation"] == "sync_patient"));
    assert!(audits.iter().all(|a| a.payload["serviceName"] == "proxyfhir"));
    assert!(audits.iter().all(|a| a.partition_key == "E1"));

    let mut statuses: Vec<_> = audits
        .iter()
        .map(|a| a.payload["metadata"]["status"].as_str().unwrap().to_string())
        .collect();
    statuses.sort();
    assert_eq!(statuses, vec!["created", "duplicate"]);
}

#[tokio::test]
async fn test_slow_audit_broker_does_not_delay_outcome() {
    let h = harness_with_audit_delay(&["A"], Duration::from_secs(3));
    h.source.set("E1", "A", Script::Records(records("A", "a", 1)));

    let outcome = tokio::time::timeout(
        Duration::from_millis(500),
        h.pipeline.ingest("E1", &CancellationToken::new()),
    )
    .await
    .expect("outcome must not wait for the audit record");

    assert_eq!(outcome.status, IngestionStatus::Created);
    assert_eq!(h.publisher.events_for(RAW_TOPIC).await.len(), 1);
    assert!(h.publisher.events_for(AUDIT_TOPIC).await.is_empty());

    h.pipeline.flush_audits().await;
    assert_eq!(h.publisher.events_for(AUDIT_TOPIC).await.len(), 1);
}

#[tokio::test]
async fn test_audit_failure_never_changes_outcome() {
    let h = harness(&["A"]);
    h.source.set("E1", "A", Script::Records(records("A", "a", 1)));
    h.publisher.fail_topic(AUDIT_TOPIC).await;

    let outcome = h.pipeline.ingest("E1", &CancellationToken::new()).await;
    h.pipeline.flush_audits().await;
    assert_eq!(outcome.status, IngestionStatus::Created);
    assert!(!outcome.publish_failed);
    assert!(outcome.error.is_none());
    assert!(h.publisher.events_for(AUDIT_TOPIC).await.is_empty());
}

#[tokio::test]
async fn test_batch_summary_counts() {
    let h = harness(&["A", "B"]);
    h.source.set("E1", "A", Script::Records(records("A", "a", 2)));
    h.source.set("E2", "A", Script::Fail("timeout".to_string()));
    h.source.set("E2", "B", Script::Fail("timeout".to_string()));
    h.source.set("E3", "B", Script::Records(records("B", "b", 1)));

    let keys = vec!["E1".to_string(), "E2".to_string(), "E3".to_string()];
    let report = h
        .pipeline
        .ingest_batch(&keys, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.summary,
        BatchSummary {
            total: 3,
            created: 2,
            duplicate: 0,
            failed: 1
        }
    );
    let statuses: Vec<_> = report.results.iter().map(|r| (r.entity_key.as_str(), r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("E1", IngestionStatus::Created),
            ("E2", IngestionStatus::Failed),
            ("E3", IngestionStatus::Created),
        ]
    );
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let h = harness(&["A"]);
    let err = h
        .pipeline
        .ingest_batch(&[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation(_)));
}

#[tokio::test]
async fn test_cancelled_batch_marks_remaining_keys() {
    let h = harness(&["A"]);
    h.source.set("E1", "A", Script::Records(records("A", "a", 1)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let keys = vec!["E1".to_string(), "E2".to_string()];
    let report = h.pipeline.ingest_batch(&keys, &cancel).await.unwrap();

    assert_eq!(report.summary.failed, 2);
    assert!(report
        .results
        .iter()
        .all(|r| r.error.as_deref().unwrap().starts_with("Cancelled")));
    assert_eq!(h.source.calls(), 0);
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_cancel_during_fetch_aborts_run() {
    let h = harness(&["A", "B"]);
    h.source.set(
        "E1",
        "A",
        Script::Slow(Duration::from_secs(60), records("A", "a", 1)),
    );
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), h.pipeline.ingest("E1", &cancel))
        .await
        .expect("cancellation should end the run promptly");

    assert_eq!(outcome.status, IngestionStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().starts_with("Cancelled"));
    assert_eq!(h.store.save_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_runs_for_one_entity_store_once() {
    let h = build_harness(
        &["A"],
        HarnessOptions {
            check_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    h.source.set(
        "E1",
        "A",
        Script::Slow(Duration::from_millis(100), records("A", "a", 2)),
    );
    let cancel = CancellationToken::new();

    let (left, right) = tokio::join!(
        h.pipeline.ingest("E1", &cancel),
        h.pipeline.ingest("E1", &cancel)
    );

    let mut statuses = vec![left.status, right.status];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![IngestionStatus::Created, IngestionStatus::Duplicate]);
    assert_eq!(h.store.len().await, 1);
    assert_eq!(h.publisher.events_for(RAW_TOPIC).await.len(), 1);
}

#[tokio::test]
async fn test_relaxed_mode_tolerates_racing_duplicate_insert() {
    let h = build_harness(
        &["A"],
        HarnessOptions {
            relaxed: true,
            check_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    h.source.set(
        "E1",
        "A",
        Script::Slow(Duration::from_millis(100), records("A", "a", 2)),
    );
    let cancel = CancellationToken::new();

    let (left, right) = tokio::join!(
        h.pipeline.ingest("E1", &cancel),
        h.pipeline.ingest("E1", &cancel)
    );

    // both runs passed the duplicate check before either insert landed
    assert_eq!(left.status, IngestionStatus::Created);
    assert_eq!(right.status, IngestionStatus::Created);
    assert_ne!(left.aggregate_id, right.aggregate_id);
    assert_eq!(left.fingerprint, right.fingerprint);

    let stored = h.store.all().await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].fingerprint, stored[1].fingerprint);
    assert_ne!(stored[0].created_at, stored[1].created_at);
    assert_eq!(h.publisher.events_for(RAW_TOPIC).await.len(), 2);

    // once stored, later runs see the fingerprint
    let later = h.pipeline.ingest("E1", &cancel).await;
    assert_eq!(later.status, IngestionStatus::Duplicate);
}

#[tokio::test]
async fn test_blank_entity_key_is_failed_without_fetching() {
    let h = harness(&["A"]);
    let outcome = h.pipeline.ingest("  ", &CancellationToken::new()).await;
    assert_eq!(outcome.status, IngestionStatus::Failed);
    assert_eq!(h.source.calls(), 0);
}
