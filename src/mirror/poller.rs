use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use super::Mirror;
use crate::store::Store;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Subtracted from the previous tick's start when computing `since`, to
    /// cover clock drift between gateway and store.
    pub skew: Duration,
    /// Every Nth tick is a full scan, which evicts deleted entities.
    pub full_reconcile_every: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            skew: Duration::from_secs(2),
            full_reconcile_every: 12,
        }
    }
}

/// Spawn the single writer for the mirror.
///
/// The refresh runs inline in the loop, so a slow tick delays the next one
/// instead of overlapping it; missed ticks are skipped.
pub fn spawn_poller(
    mirror: Arc<Mirror>,
    store: Arc<dyn Store>,
    telemetry: Arc<dyn Telemetry>,
    config: PollerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; startup already did a full load.
        interval.tick().await;

        let skew = i64::try_from(config.skew.as_secs()).unwrap_or(0);
        let full_every = config.full_reconcile_every.max(1);
        let mut last_start = Utc::now().timestamp();
        let mut tick: u32 = 0;

        loop {
            interval.tick().await;
            tick = tick.wrapping_add(1);
            let started = Utc::now().timestamp();
            let full = tick % full_every == 0;
            let since = last_start - skew;

            let mirror = mirror.clone();
            let store = store.clone();
            let timer = Instant::now();
            let result = tokio::task::spawn_blocking(move || {
                if full {
                    mirror.refresh_full(store.as_ref()).map(|s| {
                        s.keys + s.settings + s.custom_providers + s.routes + s.policies
                    })
                } else {
                    mirror.refresh_delta(store.as_ref(), since)
                }
            })
            .await;

            let kind = if full { "full" } else { "delta" };
            match result {
                Ok(Ok(applied)) => {
                    last_start = started;
                    telemetry.incr("mirror.refresh", &[("kind", kind)], 1.0);
                    if applied > 0 {
                        tracing::debug!(
                            kind,
                            applied,
                            elapsed_ms = timer.elapsed().as_millis() as u64,
                            "Mirror refreshed"
                        );
                    }
                }
                Ok(Err(e)) => {
                    // Keep last_start so the next delta re-reads this window.
                    telemetry.incr("mirror.refresh_error", &[("kind", kind)], 1.0);
                    tracing::warn!(kind, error = %e, "Mirror refresh failed");
                }
                Err(e) => {
                    telemetry.incr("mirror.refresh_error", &[("kind", kind)], 1.0);
                    tracing::error!(kind, error = %e, "Mirror refresh task panicked");
                }
            }
        }
    })
}
