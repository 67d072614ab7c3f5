//! Per-request event sink.
//!
//! Handlers push [`Event`]s into an unbounded channel; a background task
//! batches them into the store, which appends the rows and folds them into
//! the daily aggregate in one transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::store::{Event, Store};
use crate::telemetry::Telemetry;

/// Maximum number of events to buffer before flushing, regardless of timer.
const BATCH_SIZE: usize = 100;

/// How often to flush buffered events even if the batch is not full.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Events kept for retry after failed writes. Older ones are dropped first.
const MAX_PENDING: usize = 10_000;

/// Cheap handle given to every request. Recording never blocks and never
/// fails the caller.
#[derive(Clone)]
pub struct EventRecorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventRecorder {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Recorder with its receiving half, for wiring up the writer task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Event recorder is closed; dropping event");
        }
    }
}

/// Spawn the writer task. It exits once every [`EventRecorder`] is dropped
/// and the remaining buffer has been flushed.
pub fn spawn_event_recorder(
    store: Arc<dyn Store>,
    telemetry: Arc<dyn Telemetry>,
    mut rx: mpsc::UnboundedReceiver<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<Event> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(e) => {
                            buffer.push(e);
                            if buffer.len() >= BATCH_SIZE {
                                flush_batch(store.as_ref(), telemetry.as_ref(), &mut buffer);
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush_batch(store.as_ref(), telemetry.as_ref(), &mut buffer);
                            }
                            tracing::info!("Event recorder shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush_batch(store.as_ref(), telemetry.as_ref(), &mut buffer);
                    }
                }
            }
        }
    })
}

fn flush_batch(store: &dyn Store, telemetry: &dyn Telemetry, buffer: &mut Vec<Event>) {
    let events = std::mem::take(buffer);
    let count = events.len();

    match store.record_events(&events) {
        Ok(()) => tracing::debug!(count, "Flushed event batch"),
        Err(e) => {
            tracing::error!(count, error = %e, "Failed to flush event batch");
            telemetry.incr("recorder.write_error", &[], 1.0);
            buffer.extend(events);
            if buffer.len() > MAX_PENDING {
                let excess = buffer.len() - MAX_PENDING;
                buffer.drain(..excess);
                tracing::warn!(dropped = excess, "Event buffer full; dropped oldest events");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
