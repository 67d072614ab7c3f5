//! Exactly-once event emission.
//!
//! The middleware creates an [`EventGuard`] before doing anything else. The
//! guard builds and records the event when it is dropped, so every exit path
//! (denial, handler error, panic unwind, client disconnect mid-stream) emits
//! one event. Streaming responses carry the guard inside their body and emit
//! once the body is finished or abandoned.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;

use super::scope::RequestScope;
use crate::events::EventRecorder;
use crate::limits::{Limits, to_micro};
use crate::store::Event;
use crate::telemetry::Telemetry;

/// Response extension set by handlers whose body is a live stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamingResponse;

/// Where finished requests are reported.
#[derive(Clone)]
pub struct EmitSink {
    pub recorder: EventRecorder,
    pub limits: Arc<Limits>,
    pub telemetry: Arc<dyn Telemetry>,
}

pub struct EventGuard {
    scope: Arc<RequestScope>,
    sink: EmitSink,
    started: Instant,
    emitted: bool,
}

/// Whole milliseconds, rounded up so a finished request never reports zero.
pub fn latency_ms(elapsed: Duration) -> i64 {
    (elapsed.as_micros().div_ceil(1000) as i64).max(1)
}

impl EventGuard {
    pub fn new(scope: Arc<RequestScope>, sink: EmitSink) -> Self {
        Self {
            scope,
            sink,
            started: Instant::now(),
            emitted: false,
        }
    }

    pub fn scope(&self) -> &Arc<RequestScope> {
        &self.scope
    }

    fn emit(&mut self) {
        if std::mem::replace(&mut self.emitted, true) {
            return;
        }

        let state = self.scope.snapshot();
        let status = self.scope.status();
        let elapsed = self.started.elapsed();
        let key = state.key.as_deref();

        let event = Event {
            id: self.scope.request_id.clone(),
            created_at: chrono::Utc::now().timestamp(),
            tags: key.map(|k| k.tags.clone()).unwrap_or_default(),
            key_id: key.map(|k| k.key_id.clone()).unwrap_or_default(),
            cost_in_usd: state.cost_in_usd,
            provider: state.provider.clone(),
            model: state.model.clone(),
            status_code: status,
            prompt_token_count: state.prompt_tokens,
            completion_token_count: state.completion_tokens,
            latency_in_ms: latency_ms(elapsed),
            path: self.scope.path.clone(),
            method: self.scope.method.clone(),
            custom_id: self.scope.custom_id.clone(),
            user_id: String::new(),
        };

        let status_tag = status.to_string();
        let tags = [
            ("provider", event.provider.as_str()),
            ("status", status_tag.as_str()),
        ];
        self.sink.telemetry.incr("proxy.request", &tags, 1.0);
        self.sink.telemetry.timing("proxy.latency", elapsed, &tags, 1.0);

        tracing::info!(
            request_id = %event.id,
            key_id = %event.key_id,
            provider = %event.provider,
            model = %event.model,
            status,
            latency_ms = event.latency_in_ms,
            prompt_tokens = event.prompt_token_count,
            completion_tokens = event.completion_token_count,
            cost_usd = event.cost_in_usd,
            "Request finished"
        );

        if status == 200 && event.cost_in_usd > 0.0 {
            if let Some(key) = key {
                self.spend(key.key_id.clone(), key.cost_unit(), event.cost_in_usd);
            }
        }

        self.sink.recorder.record(event);
    }

    /// Fold a successful request's cost into the rolling and lifetime
    /// counters without holding up the response.
    fn spend(&self, key_id: String, unit: Option<crate::limits::TimeUnit>, cost: f64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%key_id, "No runtime to record spend on");
            return;
        };
        let limits = self.sink.limits.clone();
        let telemetry = self.sink.telemetry.clone();
        let micro = to_micro(cost);

        handle.spawn(async move {
            if let Some(unit) = unit {
                if let Err(e) = limits.add_micro_usd(&key_id, unit, micro).await {
                    tracing::warn!(%key_id, error = %e, "Failed to add rolling spend");
                    telemetry.incr("counter.error", &[("op", "add_micro_usd")], 1.0);
                }
            }
            let id = key_id.clone();
            let lifetime = tokio::task::spawn_blocking(move || limits.add_lifetime(&id, micro)).await;
            match lifetime {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(%key_id, error = %e, "Failed to add lifetime spend");
                    telemetry.incr("counter.error", &[("op", "add_lifetime")], 1.0);
                }
                Err(e) => tracing::error!(%key_id, error = %e, "Lifetime spend task failed"),
            }
        });
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        self.emit();
    }
}

pin_project! {
    /// Body stream that holds the guard until the stream ends.
    struct GuardedStream<S> {
        #[pin]
        inner: S,
        guard: Option<EventGuard>,
    }
}

impl<S, E> Stream for GuardedStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let Poll::Ready(None) = polled {
            this.guard.take();
        }
        polled
    }
}

/// Move the guard into `body`; the event is emitted once the body has been
/// fully sent or dropped.
pub fn guard_body(body: Body, guard: EventGuard) -> Body {
    Body::from_stream(GuardedStream {
        inner: body.into_data_stream(),
        guard: Some(guard),
    })
}
