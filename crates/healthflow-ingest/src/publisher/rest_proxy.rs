//! Kafka REST Proxy (v2) publisher

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{EventPublisher, PublishError, PublishResult};
use crate::config::BrokerConfig;

const KAFKA_JSON_V2: &str = "application/vnd.kafka.json.v2+json";
const KAFKA_V2: &str = "application/vnd.kafka.v2+json";

#[derive(Debug, Deserialize)]
struct ProduceResponse {
    #[serde(default)]
    offsets: Vec<ProduceOffset>,
}

#[derive(Debug, Deserialize)]
struct ProduceOffset {
    partition: Option<i32>,
    offset: Option<i64>,
    error_code: Option<i64>,
    error: Option<String>,
}

/// Publishes JSON records through a REST proxy in front of the broker
#[derive(Debug, Clone)]
pub struct RestProxyPublisher {
    client: Client,
    base_url: String,
}

impl RestProxyPublisher {
    pub fn new(config: &BrokerConfig) -> PublishResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EventPublisher for RestProxyPublisher {
    async fn publish(&self, topic: &str, partition_key: &str, payload: &Value) -> PublishResult<()> {
        let url = format!("{}/topics/{}", self.base_url, topic);
        let body = json!({
            "records": [{ "key": partition_key, "value": payload }]
        });

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, KAFKA_JSON_V2)
            .header(reqwest::header::ACCEPT, KAFKA_V2)
            .body(serde_json::to_vec(&body)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let produced: ProduceResponse = response.json().await?;
        if let Some(failed) = produced.offsets.iter().find(|o| o.error_code.is_some()) {
            return Err(PublishError::Rejected {
                topic: topic.to_string(),
                message: failed
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("error code {}", failed.error_code.unwrap_or_default())),
            });
        }

        if let Some(offset) = produced.offsets.first() {
            debug!(
                topic = %topic,
                partition_key = %partition_key,
                partition = ?offset.partition,
                offset = ?offset.offset,
                "Record accepted by broker"
            );
        }

        Ok(())
    }
}
