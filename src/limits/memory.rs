use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::counters::{CounterError, Counters};
use super::{TimeUnit, counter_key};

/// Above this many live entries, an increment sweeps out expired windows.
const PURGE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: i64,
}

/// In-process counter backend. Entries expire lazily at window end.
#[derive(Default)]
pub struct MemoryCounters {
    slots: DashMap<String, Slot>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_at(&self, entity: &str, unit: TimeUnit, delta: i64, now: DateTime<Utc>) -> i64 {
        let window = unit.window(now);
        let key = counter_key(entity, unit, window);
        let ts = now.timestamp();

        let value = {
            let mut slot = self.slots.entry(key).or_insert(Slot {
                value: 0,
                expires_at: window.end,
            });
            if slot.expires_at <= ts {
                *slot = Slot {
                    value: 0,
                    expires_at: window.end,
                };
            }
            slot.value += delta;
            slot.value
        };

        if self.slots.len() > PURGE_THRESHOLD {
            self.purge_expired(now);
        }
        value
    }

    pub fn decr_at(&self, entity: &str, unit: TimeUnit, now: DateTime<Utc>) -> i64 {
        let key = counter_key(entity, unit, unit.window(now));
        let ts = now.timestamp();
        match self.slots.get_mut(&key) {
            Some(mut slot) if slot.expires_at > ts => {
                slot.value = (slot.value - 1).max(0);
                slot.value
            }
            _ => 0,
        }
    }

    pub fn get_at(&self, entity: &str, unit: TimeUnit, now: DateTime<Utc>) -> i64 {
        let window = unit.window(now);
        let key = counter_key(entity, unit, window);
        self.slots
            .get(&key)
            .filter(|slot| slot.expires_at > now.timestamp())
            .map_or(0, |slot| slot.value)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) {
        let ts = now.timestamp();
        self.slots.retain(|_, slot| slot.expires_at > ts);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl Counters for MemoryCounters {
    async fn incr(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        Ok(self.add_at(entity, unit, 1, Utc::now()))
    }

    async fn get(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        Ok(self.get_at(entity, unit, Utc::now()))
    }

    async fn decr(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        Ok(self.decr_at(entity, unit, Utc::now()))
    }

    async fn add_micro_usd(
        &self,
        entity: &str,
        unit: TimeUnit,
        delta: i64,
    ) -> Result<i64, CounterError> {
        Ok(self.add_at(entity, unit, delta, Utc::now()))
    }

    async fn get_micro_usd(&self, entity: &str, unit: TimeUnit) -> Result<i64, CounterError> {
        Ok(self.get_at(entity, unit, Utc::now()))
    }
}
