//! Configuration management
//!
//! Everything is read from the environment (after loading `.env` if present),
//! falling back to the `DEFAULT_*` constants below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use healthflow_common::types::DEFAULT_AGGREGATE_TYPE;

// ============================================================================
// FHIR Source Constants
// ============================================================================

/// Default FHIR R4 server base URL.
pub const DEFAULT_FHIR_BASE_URL: &str = "https://hapi.fhir.org/baseR4";

/// Default timeout for a single sub-record query, in seconds.
pub const DEFAULT_FHIR_TIMEOUT_SECS: u64 = 5;

/// User agent sent to the FHIR server.
pub const DEFAULT_FHIR_USER_AGENT: &str = "HealthFlow-Ingest/1.0";

// ============================================================================
// Database Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/healthflow";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Broker Constants
// ============================================================================

/// Default Kafka REST proxy URL.
pub const DEFAULT_BROKER_REST_URL: &str = "http://localhost:8082";

/// Default broker request timeout in seconds.
pub const DEFAULT_BROKER_TIMEOUT_SECS: u64 = 10;

/// Topic receiving one notification per newly stored aggregate.
pub const DEFAULT_RAW_TOPIC: &str = "fhir.data.raw";

/// Topic receiving best-effort audit records.
pub const DEFAULT_AUDIT_TOPIC: &str = "audit.logs";

/// Top-level ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub fhir: FhirConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub pipeline: PipelineConfig,
}

/// FHIR server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FhirConfig {
    pub base_url: String,
    /// Per sub-query timeout
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl FhirConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Message broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub rest_url: String,
    pub timeout_secs: u64,
    pub raw_topic: String,
    pub audit_topic: String,
}

/// Orchestrator behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub aggregate_type: String,
    /// Run at most one ingestion per entity key at a time
    pub serialize_per_entity: bool,
    /// Emit the secondary audit event after each run
    pub audit_enabled: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = IngestConfig {
            fhir: FhirConfig {
                base_url: env_or("FHIR_BASE_URL", DEFAULT_FHIR_BASE_URL),
                timeout_secs: env_parse("FHIR_TIMEOUT_SECS", DEFAULT_FHIR_TIMEOUT_SECS),
                user_agent: env_or("FHIR_USER_AGENT", DEFAULT_FHIR_USER_AGENT),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_parse(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_parse(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_parse(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_parse(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            broker: BrokerConfig {
                rest_url: env_or("BROKER_REST_URL", DEFAULT_BROKER_REST_URL),
                timeout_secs: env_parse("BROKER_TIMEOUT_SECS", DEFAULT_BROKER_TIMEOUT_SECS),
                raw_topic: env_or("BROKER_RAW_TOPIC", DEFAULT_RAW_TOPIC),
                audit_topic: env_or("BROKER_AUDIT_TOPIC", DEFAULT_AUDIT_TOPIC),
            },
            pipeline: PipelineConfig {
                aggregate_type: env_or("INGEST_AGGREGATE_TYPE", DEFAULT_AGGREGATE_TYPE),
                serialize_per_entity: env_parse("INGEST_SERIALIZE_PER_ENTITY", true),
                audit_enabled: env_parse("INGEST_AUDIT_ENABLED", true),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fhir.base_url.trim().is_empty() {
            anyhow::bail!("FHIR base URL cannot be empty");
        }

        if self.fhir.timeout_secs == 0 {
            anyhow::bail!("FHIR sub-query timeout must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.broker.rest_url.trim().is_empty() {
            anyhow::bail!("Broker REST URL cannot be empty");
        }

        if self.broker.raw_topic.is_empty() || self.broker.audit_topic.is_empty() {
            anyhow::bail!("Broker topic names cannot be empty");
        }

        if self.pipeline.aggregate_type.is_empty() {
            anyhow::bail!("Aggregate type cannot be empty");
        }

        if !self.pipeline.serialize_per_entity {
            tracing::warn!(
                "Per-entity serialization disabled - concurrent runs for one entity may store duplicate aggregates"
            );
        }

        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fhir: FhirConfig {
                base_url: DEFAULT_FHIR_BASE_URL.to_string(),
                timeout_secs: DEFAULT_FHIR_TIMEOUT_SECS,
                user_agent: DEFAULT_FHIR_USER_AGENT.to_string(),
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            broker: BrokerConfig {
                rest_url: DEFAULT_BROKER_REST_URL.to_string(),
                timeout_secs: DEFAULT_BROKER_TIMEOUT_SECS,
                raw_topic: DEFAULT_RAW_TOPIC.to_string(),
                audit_topic: DEFAULT_AUDIT_TOPIC.to_string(),
            },
            pipeline: PipelineConfig {
                aggregate_type: DEFAULT_AGGREGATE_TYPE.to_string(),
                serialize_per_entity: true,
                audit_enabled: true,
            },
        }
    }
}
