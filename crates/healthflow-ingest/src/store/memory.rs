//! In-memory aggregate store for tests and dry runs

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use healthflow_common::{Aggregate, Fingerprint, NewAggregate};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AggregateStore, StoreError, StoreResult};

/// Vector-backed store behind a tokio `RwLock`
///
/// `created_at` is strictly increasing per entity key even when two saves land
/// within the same clock tick.
#[derive(Debug, Default)]
pub struct InMemoryAggregateStore {
    rows: RwLock<Vec<Aggregate>>,
    fail_writes: AtomicBool,
    save_calls: AtomicUsize,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `save` calls fail with [`StoreError::Unavailable`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `save` attempts, successful or not
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Aggregate> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn exists_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<bool> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .any(|a| &a.fingerprint == fingerprint))
    }

    async fn save(&self, aggregate: NewAggregate) -> StoreResult<Aggregate> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }

        let mut rows = self.rows.write().await;

        if rows.iter().any(|a| a.fingerprint == aggregate.fingerprint) {
            warn!(
                entity_key = %aggregate.entity_key,
                fingerprint = %aggregate.fingerprint,
                "Storing aggregate whose fingerprint already exists (concurrent ingestion race)"
            );
        }

        let mut now = Utc::now();
        if let Some(last) = rows
            .iter()
            .filter(|a| a.entity_key == aggregate.entity_key)
            .map(|a| a.created_at)
            .max()
        {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }

        let stored = aggregate.into_aggregate(Uuid::new_v4(), now);
        rows.push(stored.clone());
        debug!(id = %stored.id, entity_key = %stored.entity_key, "Saved aggregate in memory");
        Ok(stored)
    }

    async fn find_latest_by_entity_key(&self, entity_key: &str) -> StoreResult<Option<Aggregate>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|a| a.entity_key == entity_key)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Aggregate>> {
        Ok(self.rows.read().await.iter().find(|a| a.id == id).cloned())
    }

    async fn list_by_entity_key(&self, entity_key: &str) -> StoreResult<Vec<Aggregate>> {
        let mut found: Vec<_> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|a| a.entity_key == entity_key)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn count_by_entity_key(&self, entity_key: &str) -> StoreResult<u64> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|a| a.entity_key == entity_key)
            .count() as u64)
    }

    async fn list_by_aggregate_type(&self, aggregate_type: &str) -> StoreResult<Vec<Aggregate>> {
        let mut found: Vec<_> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|a| a.aggregate_type == aggregate_type)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn list_created_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Aggregate>> {
        let mut found: Vec<_> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|a| a.created_at >= since)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.created_at);
        Ok(found)
    }

    async fn touch(&self, id: Uuid) -> StoreResult<Aggregate> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::NotFound(id))?;
        row.updated_at = Utc::now().max(row.updated_at);
        Ok(row.clone())
    }
}
