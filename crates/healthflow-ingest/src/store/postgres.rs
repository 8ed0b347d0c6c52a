//! PostgreSQL aggregate store
//!
//! Aggregates live in `fhir_bundles`. The payload column is `json` rather than
//! `jsonb` so the stored text is byte-identical to what was fingerprinted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use healthflow_common::{Aggregate, Fingerprint, NewAggregate};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AggregateStore, StoreError, StoreResult};
use crate::config::DatabaseConfig;

const SELECT_COLUMNS: &str = r#"
    SELECT id, patient_id, bundle_type, bundle_data::text AS bundle_data,
           original_data_hash, created_at, updated_at
    FROM fhir_bundles
"#;

#[derive(Debug, sqlx::FromRow)]
struct AggregateRow {
    id: Uuid,
    patient_id: String,
    bundle_type: String,
    bundle_data: String,
    original_data_hash: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AggregateRow> for Aggregate {
    type Error = StoreError;

    fn try_from(row: AggregateRow) -> StoreResult<Self> {
        let fingerprint =
            Fingerprint::parse(&row.original_data_hash).map_err(|e| StoreError::Corrupt {
                id: row.id,
                reason: e.to_string(),
            })?;

        Ok(Aggregate {
            id: row.id,
            entity_key: row.patient_id,
            aggregate_type: row.bundle_type,
            payload: row.bundle_data,
            fingerprint,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_aggregates(rows: Vec<AggregateRow>) -> StoreResult<Vec<Aggregate>> {
    rows.into_iter().map(Aggregate::try_from).collect()
}

/// Open a connection pool sized from configuration
pub async fn connect(config: &DatabaseConfig) -> StoreResult<PgPool> {
    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Connecting to database"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// [`AggregateStore`] over a shared `PgPool`
#[derive(Debug, Clone)]
pub struct PgAggregateStore {
    pool: PgPool,
}

impl PgAggregateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from `migrations/`
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn exists_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM fhir_bundles WHERE original_data_hash = $1)",
        )
        .bind(fingerprint.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn save(&self, aggregate: NewAggregate) -> StoreResult<Aggregate> {
        let mut tx = self.pool.begin().await?;

        let already_stored = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM fhir_bundles WHERE original_data_hash = $1)",
        )
        .bind(aggregate.fingerprint.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if already_stored {
            warn!(
                entity_key = %aggregate.entity_key,
                fingerprint = %aggregate.fingerprint,
                "Storing aggregate whose fingerprint already exists (concurrent ingestion race)"
            );
        }

        let row = sqlx::query_as::<_, AggregateRow>(
            r#"
            INSERT INTO fhir_bundles (
                id, patient_id, bundle_type, bundle_data, original_data_hash,
                created_at, updated_at
            )
            SELECT $1, $2, $3, $4::json, $5, stamp.ts, stamp.ts
            FROM (SELECT clock_timestamp() AS ts) AS stamp
            RETURNING id, patient_id, bundle_type, bundle_data::text AS bundle_data,
                      original_data_hash, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&aggregate.entity_key)
        .bind(&aggregate.aggregate_type)
        .bind(&aggregate.payload)
        .bind(aggregate.fingerprint.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(id = %row.id, entity_key = %row.patient_id, "Saved aggregate");
        Aggregate::try_from(row)
    }

    async fn find_latest_by_entity_key(&self, entity_key: &str) -> StoreResult<Option<Aggregate>> {
        let sql = format!(
            "{} WHERE patient_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, AggregateRow>(&sql)
            .bind(entity_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Aggregate::try_from).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Aggregate>> {
        let sql = format!("{} WHERE id = $1", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, AggregateRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Aggregate::try_from).transpose()
    }

    async fn list_by_entity_key(&self, entity_key: &str) -> StoreResult<Vec<Aggregate>> {
        let sql = format!(
            "{} WHERE patient_id = $1 ORDER BY created_at DESC, id DESC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AggregateRow>(&sql)
            .bind(entity_key)
            .fetch_all(&self.pool)
            .await?;

        into_aggregates(rows)
    }

    async fn count_by_entity_key(&self, entity_key: &str) -> StoreResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM fhir_bundles WHERE patient_id = $1",
        )
        .bind(entity_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn list_by_aggregate_type(&self, aggregate_type: &str) -> StoreResult<Vec<Aggregate>> {
        let sql = format!(
            "{} WHERE bundle_type = $1 ORDER BY created_at DESC, id DESC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AggregateRow>(&sql)
            .bind(aggregate_type)
            .fetch_all(&self.pool)
            .await?;

        into_aggregates(rows)
    }

    async fn list_created_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Aggregate>> {
        let sql = format!("{} WHERE created_at >= $1 ORDER BY created_at ASC", SELECT_COLUMNS);
        let rows = sqlx::query_as::<_, AggregateRow>(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        into_aggregates(rows)
    }

    async fn touch(&self, id: Uuid) -> StoreResult<Aggregate> {
        let row = sqlx::query_as::<_, AggregateRow>(
            r#"
            UPDATE fhir_bundles
            SET updated_at = GREATEST(clock_timestamp(), updated_at)
            WHERE id = $1
            RETURNING id, patient_id, bundle_type, bundle_data::text AS bundle_data,
                      original_data_hash, created_at, updated_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        Aggregate::try_from(row)
    }
}
