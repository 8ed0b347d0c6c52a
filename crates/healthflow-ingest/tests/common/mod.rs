//! Shared helpers for ingestion integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use healthflow_common::{Aggregate, Fingerprint, NewAggregate};
use healthflow_ingest::publisher::PublishResult;
use healthflow_ingest::source::SourceResult;
use healthflow_ingest::store::StoreResult;
use healthflow_ingest::{
    AggregateBuilder, AggregateStore, EventPublisher, IngestionNotifier, IngestionPipeline,
    InMemoryAggregateStore, InMemoryPublisher, RecordFetcher, RecordSource, SourceError,
    SubRecordQuery,
};
use serde_json::{json, Value};
use uuid::Uuid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RAW_TOPIC: &str = "fhir.data.raw";
pub const AUDIT_TOPIC: &str = "audit.logs";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,healthflow_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Canned answer for one (entity key, record type) pair
#[derive(Clone)]
pub enum Script {
    Records(Vec<Value>),
    Fail(String),
    Slow(Duration, Vec<Value>),
}

/// Record source whose answers can be changed between runs
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<(String, String), Script>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn set(&self, entity_key: &str, record_type: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert((entity_key.to_string(), record_type.to_string()), script);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch(&self, entity_key: &str, query: &SubRecordQuery) -> SourceResult<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&(entity_key.to_string(), query.record_type.clone()))
            .cloned();

        match script {
            None => Ok(Vec::new()),
            Some(Script::Records(records)) => Ok(records),
            Some(Script::Fail(reason)) => Err(SourceError::Malformed(reason)),
            Some(Script::Slow(delay, records)) => {
                tokio::time::sleep(delay).await;
                Ok(records)
            },
        }
    }
}

/// `count` records of `record_type` with ids `{prefix}1..`
pub fn records(record_type: &str, prefix: &str, count: usize) -> Vec<Value> {
    (1..=count)
        .map(|i| {
            json!({
                "resourceType": record_type,
                "id": format!("{}{}", prefix, i),
                "status": "final"
            })
        })
        .collect()
}

/// Publisher that holds back one topic before handing events on
pub struct DelayedPublisher {
    inner: Arc<InMemoryPublisher>,
    topic: String,
    delay: Duration,
}

#[async_trait]
impl EventPublisher for DelayedPublisher {
    async fn publish(&self, topic: &str, partition_key: &str, payload: &Value) -> PublishResult<()> {
        if topic == self.topic {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.publish(topic, partition_key, payload).await
    }
}

/// Store whose duplicate check answers and then stalls, widening the gap
/// between check and insert
pub struct SlowCheckStore {
    inner: Arc<InMemoryAggregateStore>,
    delay: Duration,
}

#[async_trait]
impl AggregateStore for SlowCheckStore {
    async fn exists_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<bool> {
        let exists = self.inner.exists_by_fingerprint(fingerprint).await?;
        tokio::time::sleep(self.delay).await;
        Ok(exists)
    }

    async fn save(&self, aggregate: NewAggregate) -> StoreResult<Aggregate> {
        self.inner.save(aggregate).await
    }

    async fn find_latest_by_entity_key(&self, entity_key: &str) -> StoreResult<Option<Aggregate>> {
        self.inner.find_latest_by_entity_key(entity_key).await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Aggregate>> {
        self.inner.find_by_id(id).await
    }

    async fn list_by_entity_key(&self, entity_key: &str) -> StoreResult<Vec<Aggregate>> {
        self.inner.list_by_entity_key(entity_key).await
    }

    async fn count_by_entity_key(&self, entity_key: &str) -> StoreResult<u64> {
        self.inner.count_by_entity_key(entity_key).await
    }

    async fn list_by_aggregate_type(&self, aggregate_type: &str) -> StoreResult<Vec<Aggregate>> {
        self.inner.list_by_aggregate_type(aggregate_type).await
    }

    async fn list_created_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Aggregate>> {
        self.inner.list_created_since(since).await
    }

    async fn touch(&self, id: Uuid) -> StoreResult<Aggregate> {
        self.inner.touch(id).await
    }
}

/// Knobs for [`build_harness`]
#[derive(Default)]
pub struct HarnessOptions {
    pub relaxed: bool,
    pub check_delay: Option<Duration>,
    pub audit_delay: Option<Duration>,
}

/// Pipeline wired to in-memory collaborators
pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub store: Arc<InMemoryAggregateStore>,
    pub publisher: Arc<InMemoryPublisher>,
    pub pipeline: IngestionPipeline,
}

pub fn harness(record_types: &[&str]) -> Harness {
    build_harness(record_types, HarnessOptions::default())
}

pub fn harness_with_audit_delay(record_types: &[&str], delay: Duration) -> Harness {
    build_harness(
        record_types,
        HarnessOptions {
            audit_delay: Some(delay),
            ..Default::default()
        },
    )
}

pub fn build_harness(record_types: &[&str], options: HarnessOptions) -> Harness {
    init_tracing();

    let source = Arc::new(ScriptedSource::default());
    let store = Arc::new(InMemoryAggregateStore::new());
    let publisher = Arc::new(InMemoryPublisher::new());

    let queries = record_types
        .iter()
        .map(|t| SubRecordQuery::subject_search(*t, 50))
        .collect();
    let fetcher = RecordFetcher::new(source.clone(), queries, Duration::from_secs(2));

    let sink: Arc<dyn EventPublisher> = match options.audit_delay {
        Some(delay) => Arc::new(DelayedPublisher {
            inner: publisher.clone(),
            topic: AUDIT_TOPIC.to_string(),
            delay,
        }),
        None => publisher.clone(),
    };
    let notifier = IngestionNotifier::new(sink, RAW_TOPIC, AUDIT_TOPIC);

    let pipeline_store: Arc<dyn AggregateStore> = match options.check_delay {
        Some(delay) => Arc::new(SlowCheckStore {
            inner: store.clone(),
            delay,
        }),
        None => store.clone(),
    };

    let pipeline = IngestionPipeline::new(
        fetcher,
        AggregateBuilder::new("Patient"),
        pipeline_store,
        notifier,
    )
    .with_serialize_per_entity(!options.relaxed);

    Harness {
        source,
        store,
        publisher,
        pipeline,
    }
}
