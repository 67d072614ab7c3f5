//! Metrics sink.
//!
//! Counters and timings are emitted as structured `tracing` events under the
//! `tollgate::telemetry` target so any subscriber layer (or a log shipper
//! feeding statsd/prometheus) can pick them up.

use std::time::Duration;

/// Destination for request-path metrics. Implementations must never fail
/// the caller.
pub trait Telemetry: Send + Sync {
    fn incr(&self, name: &str, tags: &[(&str, &str)], rate: f64);

    fn timing(&self, name: &str, duration: Duration, tags: &[(&str, &str)], rate: f64);
}

fn render_tags(tags: &[(&str, &str)]) -> String {
    tags.iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct TracingTelemetry {
    provider: String,
}

impl TracingTelemetry {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl Telemetry for TracingTelemetry {
    fn incr(&self, name: &str, tags: &[(&str, &str)], rate: f64) {
        tracing::info!(
            target: "tollgate::telemetry",
            sink = %self.provider,
            metric = name,
            kind = "count",
            value = 1,
            tags = %render_tags(tags),
            rate,
        );
    }

    fn timing(&self, name: &str, duration: Duration, tags: &[(&str, &str)], rate: f64) {
        tracing::info!(
            target: "tollgate::telemetry",
            sink = %self.provider,
            metric = name,
            kind = "timing",
            value_ms = duration.as_millis() as u64,
            tags = %render_tags(tags),
            rate,
        );
    }
}

/// Discards everything.
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn incr(&self, _name: &str, _tags: &[(&str, &str)], _rate: f64) {}

    fn timing(&self, _name: &str, _duration: Duration, _tags: &[(&str, &str)], _rate: f64) {}
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records metric names for assertions.
    #[derive(Default)]
    pub struct RecordingTelemetry {
        pub names: Mutex<Vec<String>>,
    }

    impl RecordingTelemetry {
        pub fn count(&self, name: &str) -> usize {
            self.names
                .lock()
                .unwrap()
                .iter()
                .filter(|n| *n == name)
                .count()
        }
    }

    impl Telemetry for RecordingTelemetry {
        fn incr(&self, name: &str, _tags: &[(&str, &str)], _rate: f64) {
            self.names.lock().unwrap().push(name.to_string());
        }

        fn timing(&self, name: &str, _duration: Duration, _tags: &[(&str, &str)], _rate: f64) {
            self.names.lock().unwrap().push(name.to_string());
        }
    }
}
