//! Rolling rate/cost counters, the lifetime spend ledger and the validator
//! that reads them.

pub mod counters;
pub mod memory;
pub mod redis;
pub mod validator;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};

pub use self::counters::{CounterError, Counters, Limits};
pub use self::memory::MemoryCounters;
pub use self::redis::RedisCounters;
pub use self::validator::{ValidationFailure, Validator};

/// Convert USD to integer micro-USD, truncating toward zero.
pub fn to_micro(usd: f64) -> i64 {
    (usd * 1_000_000.0) as i64
}

// ---------------------------------------------------------------------------
// TimeUnit
// ---------------------------------------------------------------------------

/// Window granularity for rolling counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Month => "mo",
        }
    }

    /// The window containing `now`.
    pub fn window(self, now: DateTime<Utc>) -> Window {
        let ts = now.timestamp();
        let fixed = |len: i64| {
            let start = ts - ts.rem_euclid(len);
            Window {
                start,
                end: start + len,
            }
        };
        match self {
            Self::Second => fixed(1),
            Self::Minute => fixed(60),
            Self::Hour => fixed(3_600),
            Self::Day => fixed(86_400),
            Self::Month => month_window(now),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(Self::Second),
            "m" => Ok(Self::Minute),
            "h" => Ok(Self::Hour),
            "d" => Ok(Self::Day),
            "mo" => Ok(Self::Month),
            other => Err(format!("unknown time unit: {other}")),
        }
    }
}

/// Half-open `[start, end)` interval in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn id(&self) -> i64 {
        self.start
    }
}

/// First of the month (UTC) up to the first of the next month.
fn month_window(now: DateTime<Utc>) -> Window {
    let naive = now.date_naive();
    let start = Utc
        .with_ymd_and_hms(naive.year(), naive.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let end = start
        .checked_add_months(Months::new(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Window {
        start: start.timestamp(),
        end: end.timestamp(),
    }
}

/// Storage key for a counter: `<entity>:<unit>:<windowId>`.
pub fn counter_key(entity: &str, unit: TimeUnit, window: Window) -> String {
    format!("{entity}:{unit}:{}", window.id())
}

/// Entity under which rolling cost for a key is counted, kept apart from the
/// request counter of the same unit.
pub fn cost_entity(key_id: &str) -> String {
    format!("{key_id}.cost")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
