use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{TimeUnit, cost_entity};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("store read task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Rolling counters keyed by `(entity, unit)` for the current window.
///
/// Implementations must increment atomically; values reset when the window
/// rolls over.
#[async_trait]
pub trait Counters: Send + Sync {
    /// Increment the request counter, returning the new value.
    async fn incr(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError>;

    async fn get(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError>;

    /// Undo one increment in the current window. Never goes below zero.
    async fn decr(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError>;

    /// Add micro-USD to the rolling cost counter, returning the new value.
    async fn add_micro_usd(
        &self,
        entity: &str,
        unit: TimeUnit,
        delta: i64,
    ) -> Result<i64, CounterError>;

    async fn get_micro_usd(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError>;
}

/// Rolling counters plus the durable lifetime spend ledger.
///
/// Lifetime spend is cached in process and written through to the store on
/// every add, so a restart of the counter backend loses nothing.
pub struct Limits {
    counters: Arc<dyn Counters>,
    store: Arc<dyn Store>,
    lifetime: DashMap<String, i64>,
}

impl Limits {
    pub fn new(counters: Arc<dyn Counters>, store: Arc<dyn Store>) -> Self {
        Self {
            counters,
            store,
            lifetime: DashMap::new(),
        }
    }

    pub async fn incr(&self, key_id: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.counters.incr(key_id, unit).await
    }

    pub async fn get(&self, key_id: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.counters.get(key_id, unit).await
    }

    pub async fn decr(&self, key_id: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.counters.decr(key_id, unit).await
    }

    pub async fn add_micro_usd(
        &self,
        key_id: &str,
        unit: TimeUnit,
        delta: i64,
    ) -> Result<i64, CounterError> {
        self.counters
            .add_micro_usd(&cost_entity(key_id), unit, delta)
            .await
    }

    pub async fn get_micro_usd(&self, key_id: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.counters.get_micro_usd(&cost_entity(key_id), unit).await
    }

    /// Lifetime spend in micro-USD. A cache miss reads the store on the
    /// blocking pool.
    pub async fn get_lifetime(&self, key_id: &str) -> Result<i64, CounterError> {
        if let Some(v) = self.lifetime.get(key_id) {
            return Ok(*v);
        }
        let store = self.store.clone();
        let id = key_id.to_string();
        let v = tokio::task::spawn_blocking(move || store.lifetime_spend(&id)).await??;
        // A concurrent add may have cached a newer total meanwhile.
        Ok(*self.lifetime.entry(key_id.to_string()).or_insert(v))
    }

    pub fn add_lifetime(&self, key_id: &str, delta: i64) -> Result<i64, CounterError> {
        let total = self.store.add_lifetime_spend(key_id, delta)?;
        self.lifetime.insert(key_id.to_string(), total);
        Ok(total)
    }
}
