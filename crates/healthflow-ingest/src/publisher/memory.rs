//! Recording publisher for tests and dry runs

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::RwLock;

use super::{EventPublisher, PublishError, PublishResult};

/// One accepted publish call
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub partition_key: String,
    pub payload: Value,
}

/// Keeps every published event in memory; individual topics can be made to fail
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    events: RwLock<Vec<PublishedEvent>>,
    failing_topics: RwLock<HashSet<String>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_topic(&self, topic: &str) {
        self.failing_topics.write().await.insert(topic.to_string());
    }

    pub async fn recover_topic(&self, topic: &str) {
        self.failing_topics.write().await.remove(topic);
    }

    pub async fn events(&self) -> Vec<PublishedEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_for(&self, topic: &str) -> Vec<PublishedEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, partition_key: &str, payload: &Value) -> PublishResult<()> {
        if self.failing_topics.read().await.contains(topic) {
            return Err(PublishError::Unavailable(format!("topic {} is failing", topic)));
        }

        self.events.write().await.push(PublishedEvent {
            topic: topic.to_string(),
            partition_key: partition_key.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
