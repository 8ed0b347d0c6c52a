//! Downstream notifications
//!
//! [`EventPublisher`] is a bare topic/key/payload sink with at-least-once
//! semantics. [`IngestionNotifier`] owns the stable event contract consumers
//! rely on: one `fhir_data_ingested` event per newly stored aggregate, keyed by
//! entity key, plus a best-effort audit record.

pub mod memory;
pub mod rest_proxy;

use async_trait::async_trait;
use chrono::Utc;
use healthflow_common::Aggregate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use memory::{InMemoryPublisher, PublishedEvent};
pub use rest_proxy::RestProxyPublisher;

/// Source tag stamped on every event
pub const EVENT_SOURCE: &str = "proxyfhir";

/// Event type of the primary notification
pub const INGESTED_EVENT_TYPE: &str = "fhir_data_ingested";

/// Result type for publish operations
pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// Error types for broker publishing
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Broker returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Broker rejected record on {topic}: {message}")]
    Rejected { topic: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Topic-based publish with partition-key semantics
///
/// Implementations must provide at-least-once delivery; consumers tolerate
/// duplicates.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, partition_key: &str, payload: &Value) -> PublishResult<()>;
}

/// Primary notification for a newly stored aggregate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestedEvent {
    pub bundle_id: Uuid,
    pub patient_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub source: String,
    pub event_type: String,
}

impl IngestedEvent {
    pub fn for_aggregate(aggregate: &Aggregate) -> Self {
        Self {
            bundle_id: aggregate.id,
            patient_id: aggregate.entity_key.clone(),
            timestamp: Utc::now().timestamp_millis(),
            source: EVENT_SOURCE.to_string(),
            event_type: INGESTED_EVENT_TYPE.to_string(),
        }
    }
}

/// Best-effort audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub service_name: String,
    pub operation: String,
    pub patient_id: String,
    pub metadata: Value,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl AuditEvent {
    pub fn new(operation: impl Into<String>, patient_id: impl Into<String>, metadata: Value) -> Self {
        Self {
            service_name: EVENT_SOURCE.to_string(),
            operation: operation.into(),
            patient_id: patient_id.into(),
            metadata,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Event contract on top of an [`EventPublisher`]
#[derive(Clone)]
pub struct IngestionNotifier {
    publisher: Arc<dyn EventPublisher>,
    raw_topic: String,
    audit_topic: String,
}

impl IngestionNotifier {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        raw_topic: impl Into<String>,
        audit_topic: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            raw_topic: raw_topic.into(),
            audit_topic: audit_topic.into(),
        }
    }

    pub fn raw_topic(&self) -> &str {
        &self.raw_topic
    }

    pub fn audit_topic(&self) -> &str {
        &self.audit_topic
    }

    /// Announce a newly stored aggregate, keyed by its entity key
    pub async fn aggregate_stored(&self, aggregate: &Aggregate) -> PublishResult<()> {
        let event = serde_json::to_value(IngestedEvent::for_aggregate(aggregate))?;
        self.publisher
            .publish(&self.raw_topic, &aggregate.entity_key, &event)
            .await?;

        debug!(
            topic = %self.raw_topic,
            entity_key = %aggregate.entity_key,
            aggregate_id = %aggregate.id,
            "Published ingestion event"
        );
        Ok(())
    }

    /// Send an audit record; failures are logged and discarded
    pub async fn audit(&self, event: AuditEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit event");
                return;
            },
        };

        if let Err(e) = self
            .publisher
            .publish(&self.audit_topic, &event.patient_id, &payload)
            .await
        {
            warn!(
                topic = %self.audit_topic,
                operation = %event.operation,
                error = %e,
                "Failed to send audit event"
            );
        }
    }
}
