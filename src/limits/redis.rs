use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use super::counters::{CounterError, Counters};
use super::{TimeUnit, counter_key};

/// Decrement only while the counter is positive.
const DECR_SCRIPT: &str = r#"
local cur = tonumber(redis.call("GET", KEYS[1]) or "0")
if cur <= 0 then
  return 0
end
return redis.call("DECR", KEYS[1])
"#;

/// Counter backend shared between gateway replicas.
///
/// Increments run as a `MULTI` pipeline of `INCRBY` + `EXPIREAT` so the key
/// never outlives its window. One reconnecting connection is opened on first
/// use and shared by every operation.
#[derive(Clone)]
pub struct RedisCounters {
    client: ::redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
    prefix: String,
}

impl std::fmt::Debug for RedisCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounters")
            .field("prefix", &self.prefix)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

impl RedisCounters {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CounterError> {
        Ok(Self {
            client: ::redis::Client::open(url.as_ref())?,
            conn: Arc::new(OnceCell::new()),
            prefix: "tollgate".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<ConnectionManager, ::redis::RedisError> {
        let manager = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    pub async fn ping(&self) -> Result<(), CounterError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key(&self, entity: &str, unit: TimeUnit) -> (String, i64) {
        let window = unit.window(Utc::now());
        (
            format!("{}:{}", self.prefix, counter_key(entity, unit, window)),
            window.end,
        )
    }

    async fn add(&self, entity: &str, unit: TimeUnit, delta: i64) -> Result<i64, CounterError> {
        let (key, expires_at) = self.key(entity, unit);
        let mut conn = self.connection().await?;
        let (value,): (i64,) = ::redis::pipe()
            .atomic()
            .incr(&key, delta)
            .expire_at(&key, expires_at)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn decrement(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        let (key, _) = self.key(entity, unit);
        let mut conn = self.connection().await?;
        let value: i64 = ::redis::Script::new(DECR_SCRIPT)
            .key(&key)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn read(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        let (key, _) = self.key(entity, unit);
        let mut conn = self.connection().await?;
        let value: Option<i64> = conn.get(&key).await?;
        Ok(value.unwrap_or(0))
    }
}

#[async_trait]
impl Counters for RedisCounters {
    async fn incr(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.add(entity, unit, 1).await
    }

    async fn get(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.read(entity, unit).await
    }

    async fn decr(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.decrement(entity, unit).await
    }

    async fn add_micro_usd(
        &self,
        entity: &str,
        unit: TimeUnit,
        delta: i64,
    ) -> Result<i64, CounterError> {
        self.add(entity, unit, delta).await
    }

    async fn get_micro_usd(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        self.read(entity, unit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_prefixed_and_expires_at_window_end() {
        let counters = RedisCounters::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_prefix("test");
        let (key, expires_at) = counters.key("k1", TimeUnit::Hour);
        let window = TimeUnit::Hour.window(Utc::now());
        assert!(key.starts_with("test:k1:h:"));
        assert!(expires_at > Utc::now().timestamp() - 1);
        assert!(expires_at <= window.end);
    }

    #[test]
    fn test_clones_share_one_connection_slot() {
        let counters = RedisCounters::new("redis://127.0.0.1:6379").unwrap();
        let clone = counters.clone();
        assert!(Arc::ptr_eq(&counters.conn, &clone.conn));
        assert!(!counters.conn.initialized());
    }

    #[test]
    fn test_rejects_malformed_url() {
        assert!(RedisCounters::new("not a url").is_err());
    }
}
