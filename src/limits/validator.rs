use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Limits, TimeUnit, to_micro};
use crate::error::ExpiryReason;
use crate::store::ApiKey;
use crate::telemetry::Telemetry;

/// Why a key may not make this request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("{0}")]
    Invalid(String),

    #[error("key expired: {}", .0.as_str())]
    Expired(ExpiryReason),

    #[error("{over} requests per {unit}")]
    RateLimited { unit: TimeUnit, over: i64 },

    #[error("cost limit of ${limit} per {unit} reached")]
    CostRateLimited { unit: TimeUnit, limit: f64 },
}

/// Admission check.
///
/// Everything is read-only except the request counter: a rate-limited key
/// takes its slot with one atomic increment and the returned count decides
/// admission, so concurrent requests can never overshoot the limit. Any
/// denial hands the slot back.
pub struct Validator {
    limits: Arc<Limits>,
    telemetry: Arc<dyn Telemetry>,
}

impl Validator {
    pub fn new(limits: Arc<Limits>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self { limits, telemetry }
    }

    pub async fn validate(
        &self,
        key: Option<&ApiKey>,
        prompt_cost: f64,
    ) -> Result<(), ValidationFailure> {
        self.validate_at(key, prompt_cost, Utc::now()).await
    }

    /// Checks run in order and stop at the first failure.
    pub async fn validate_at(
        &self,
        key: Option<&ApiKey>,
        prompt_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationFailure> {
        let Some(key) = key else {
            return Err(ValidationFailure::Invalid("api key not found".into()));
        };
        if key.revoked {
            return Err(ValidationFailure::Invalid("api key has been revoked".into()));
        }

        if let Some(ttl) = key.ttl_duration() {
            let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            if key.created_at.saturating_add(ttl) <= now.timestamp() {
                return Err(ValidationFailure::Expired(ExpiryReason::Ttl));
            }
        }

        let reserved = self.reserve_rate_slot(key).await?;
        let spend = self.check_spend(key, to_micro(prompt_cost)).await;
        if spend.is_err() {
            if let Some(unit) = reserved {
                self.release(key, unit).await;
            }
        }
        spend
    }

    /// Take one request slot. Returns the unit taken, or `None` when the key
    /// is not rate limited or the counter could not be reached.
    async fn reserve_rate_slot(&self, key: &ApiKey) -> Result<Option<TimeUnit>, ValidationFailure> {
        if key.rate_limit_over_time <= 0 {
            return Ok(None);
        }
        let Some(unit) = key.rate_unit() else {
            return Ok(None);
        };
        let count = match self.limits.incr(&key.key_id, unit).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key_id = %key.key_id, error = %e, "Rate counter increment failed");
                self.telemetry.incr("counter.error", &[("op", "incr")], 1.0);
                return Ok(None);
            }
        };
        if count > key.rate_limit_over_time {
            self.release(key, unit).await;
            return Err(ValidationFailure::RateLimited {
                unit,
                over: key.rate_limit_over_time,
            });
        }
        Ok(Some(unit))
    }

    async fn release(&self, key: &ApiKey, unit: TimeUnit) {
        if let Err(e) = self.limits.decr(&key.key_id, unit).await {
            tracing::warn!(key_id = %key.key_id, error = %e, "Rate counter release failed");
            self.telemetry.incr("counter.error", &[("op", "decr")], 1.0);
        }
    }

    async fn check_spend(&self, key: &ApiKey, prompt_micro: i64) -> Result<(), ValidationFailure> {
        if key.cost_limit_in_usd_over_time > 0.0 {
            if let Some(unit) = key.cost_unit() {
                let cached = match self.limits.get_micro_usd(&key.key_id, unit).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(key_id = %key.key_id, error = %e, "Cost counter read failed");
                        0
                    }
                };
                if cached + prompt_micro > to_micro(key.cost_limit_in_usd_over_time) {
                    return Err(ValidationFailure::CostRateLimited {
                        unit,
                        limit: key.cost_limit_in_usd_over_time,
                    });
                }
            }
        }

        if key.cost_limit_in_usd > 0.0 {
            let lifetime = match self.limits.get_lifetime(&key.key_id).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(key_id = %key.key_id, error = %e, "Lifetime spend read failed");
                    0
                }
            };
            if lifetime + prompt_micro > to_micro(key.cost_limit_in_usd) {
                return Err(ValidationFailure::Expired(ExpiryReason::CostLimit));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::limits::MemoryCounters;
    use crate::store::SqliteStore;
    use crate::telemetry::NoopTelemetry;
    use chrono::TimeZone;

    fn setup() -> (Validator, Arc<Limits>) {
        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        let limits = Arc::new(Limits::new(Arc::new(MemoryCounters::new()), store));
        (Validator::new(limits.clone(), Arc::new(NoopTelemetry)), limits)
    }

    fn key() -> ApiKey {
        ApiKey {
            key_id: "k1".into(),
            name: "k".into(),
            key: "h".into(),
            created_at: 1_000,
            ..Default::default()
        }
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[tokio::test]
    async fn test_missing_and_revoked() {
        let (v, _) = setup();
        assert!(matches!(
            v.validate(None, 0.0).await,
            Err(ValidationFailure::Invalid(_))
        ));
        let mut k = key();
        k.revoked = true;
        assert!(matches!(
            v.validate(Some(&k), 0.0).await,
            Err(ValidationFailure::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_ttl_boundary_is_exclusive() {
        let (v, _) = setup();
        let mut k = key();
        k.ttl = "1s".into();
        assert!(v.validate_at(Some(&k), 0.0, at(1_000)).await.is_ok());
        assert_eq!(
            v.validate_at(Some(&k), 0.0, at(1_001)).await,
            Err(ValidationFailure::Expired(ExpiryReason::Ttl))
        );
    }

    #[tokio::test]
    async fn test_rate_limit_boundary() {
        let (v, limits) = setup();
        let mut k = key();
        k.rate_limit_over_time = 2;
        k.rate_limit_unit = "m".into();

        limits.incr("k1", TimeUnit::Minute).await.unwrap();
        // Counter at R-1 admits one more and takes the slot.
        assert!(v.validate(Some(&k), 0.0).await.is_ok());
        assert_eq!(limits.get("k1", TimeUnit::Minute).await.unwrap(), 2);

        assert!(matches!(
            v.validate(Some(&k), 0.0).await,
            Err(ValidationFailure::RateLimited { over: 2, .. })
        ));
        // The denied request does not keep a slot.
        assert_eq!(limits.get("k1", TimeUnit::Minute).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_rate() {
        let (v, limits) = setup();
        let v = Arc::new(v);
        let mut k = key();
        k.rate_limit_over_time = 5;
        k.rate_limit_unit = "h".into();
        let k = Arc::new(k);

        let barrier = Arc::new(tokio::sync::Barrier::new(64));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let (v, k, barrier) = (v.clone(), k.clone(), barrier.clone());
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                v.validate(Some(k.as_ref()), 0.0).await.is_ok()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(limits.get("k1", TimeUnit::Hour).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_spend_denial_releases_rate_slot() {
        let (v, limits) = setup();
        let mut k = key();
        k.rate_limit_over_time = 10;
        k.rate_limit_unit = "m".into();
        k.cost_limit_in_usd = 0.5;

        limits.add_lifetime("k1", 500_000).unwrap();
        assert_eq!(
            v.validate(Some(&k), 0.01).await,
            Err(ValidationFailure::Expired(ExpiryReason::CostLimit))
        );
        assert_eq!(limits.get("k1", TimeUnit::Minute).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rolling_cost_limit() {
        let (v, limits) = setup();
        let mut k = key();
        k.cost_limit_in_usd_over_time = 1.0;
        k.cost_limit_in_usd_unit = "d".into();

        limits
            .add_micro_usd("k1", TimeUnit::Day, 900_000)
            .await
            .unwrap();
        assert!(v.validate(Some(&k), 0.1).await.is_ok());
        assert!(matches!(
            v.validate(Some(&k), 0.2).await,
            Err(ValidationFailure::CostRateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifetime_cost_limit_expires() {
        let (v, limits) = setup();
        let mut k = key();
        k.cost_limit_in_usd = 0.5;

        limits.add_lifetime("k1", 500_000).unwrap();
        // Exactly at the limit with no prompt cost is still admitted.
        assert!(v.validate(Some(&k), 0.0).await.is_ok());
        assert_eq!(
            v.validate(Some(&k), 0.000001).await,
            Err(ValidationFailure::Expired(ExpiryReason::CostLimit))
        );
    }

    #[tokio::test]
    async fn test_ttl_checked_before_rate() {
        let (v, limits) = setup();
        let mut k = key();
        k.ttl = "1s".into();
        k.rate_limit_over_time = 1;
        k.rate_limit_unit = "s".into();
        limits.incr("k1", TimeUnit::Second).await.unwrap();
        assert_eq!(
            v.validate_at(Some(&k), 0.0, at(5_000)).await,
            Err(ValidationFailure::Expired(ExpiryReason::Ttl))
        );
    }
}
