//! Aggregate persistence
//!
//! The pipeline only needs three operations (`exists_by_fingerprint`, `save`
//! and `find_latest_by_entity_key`); the rest serve operational queries.
//! Duplicate detection is check-then-insert: there is no uniqueness
//! constraint on the fingerprint, so a racing duplicate insert is logged as an
//! anomaly rather than rejected.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use healthflow_common::{Aggregate, Fingerprint, NewAggregate};
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryAggregateStore;
pub use postgres::PgAggregateStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error types for the aggregate store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Aggregate not found: {0}")]
    NotFound(Uuid),

    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed aggregate store shared by concurrent ingestion runs
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Whether any aggregate with this fingerprint has been stored
    async fn exists_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<bool>;

    /// Persist a new aggregate, assigning its id and timestamps
    async fn save(&self, aggregate: NewAggregate) -> StoreResult<Aggregate>;

    /// Most recently created aggregate for `entity_key`
    async fn find_latest_by_entity_key(&self, entity_key: &str) -> StoreResult<Option<Aggregate>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Aggregate>>;

    /// All aggregates for `entity_key`, newest first
    async fn list_by_entity_key(&self, entity_key: &str) -> StoreResult<Vec<Aggregate>>;

    async fn count_by_entity_key(&self, entity_key: &str) -> StoreResult<u64>;

    /// All aggregates of `aggregate_type`, newest first
    async fn list_by_aggregate_type(&self, aggregate_type: &str) -> StoreResult<Vec<Aggregate>>;

    /// Aggregates created at or after `since`, oldest first
    async fn list_created_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Aggregate>>;

    /// Refresh `updated_at`; the only mutation an aggregate ever sees
    async fn touch(&self, id: Uuid) -> StoreResult<Aggregate>;
}
