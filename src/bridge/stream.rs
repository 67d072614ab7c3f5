//! Relaying an upstream event stream while accounting for it.

use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use super::{Flow, StreamAccountant};
use crate::net::{SseEvent, SseStream};
use crate::proxy::scope::RequestScope;

pin_project! {
    /// Forwards SSE events byte-for-byte and settles usage into the request
    /// scope exactly once: at end of stream, on upstream error, when the
    /// deadline passes, or when the client goes away.
    pub struct AccountingStream<S> {
        #[pin]
        events: SseStream<S>,
        deadline: Pin<Box<Sleep>>,
        accountant: Box<dyn StreamAccountant>,
        scope: Arc<RequestScope>,
        ended: bool,
        settled: bool,
    }

    impl<S> PinnedDrop for AccountingStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            settle(this.settled, this.accountant.as_mut(), this.scope);
        }
    }
}

impl<S> AccountingStream<S> {
    pub fn new(
        bytes: S,
        accountant: Box<dyn StreamAccountant>,
        scope: Arc<RequestScope>,
        deadline: Instant,
    ) -> Self {
        Self {
            events: SseStream::new(bytes),
            deadline: Box::pin(sleep_until(deadline)),
            accountant,
            scope,
            ended: false,
            settled: false,
        }
    }
}

fn settle(settled: &mut bool, accountant: &mut dyn StreamAccountant, scope: &RequestScope) {
    if std::mem::replace(settled, true) {
        return;
    }
    scope.record_usage(accountant.finish());
}

fn error_event(message: &str) -> Bytes {
    let body = serde_json::json!({
        "error": { "message": message, "type": "api_error" }
    });
    SseEvent::named("error", body.to_string()).to_bytes()
}

impl<S, E> Stream for AccountingStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.ended {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            tracing::warn!(request_id = %this.scope.request_id, "Upstream stream hit its deadline");
            *this.ended = true;
            settle(this.settled, this.accountant.as_mut(), this.scope);
            return Poll::Ready(None);
        }

        match this.events.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                if let Flow::Stop = this.accountant.observe(&event) {
                    *this.ended = true;
                    settle(this.settled, this.accountant.as_mut(), this.scope);
                }
                Poll::Ready(Some(Ok(event.to_bytes())))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(request_id = %this.scope.request_id, error = %e, "Upstream stream failed");
                *this.ended = true;
                settle(this.settled, this.accountant.as_mut(), this.scope);
                Poll::Ready(Some(Ok(error_event(&e.to_string()))))
            }
            Poll::Ready(None) => {
                *this.ended = true;
                settle(this.settled, this.accountant.as_mut(), this.scope);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::StreamExt;
    use futures::stream;

    use super::*;
    use crate::proxy::scope::Usage;

    /// Counts events and the number of times it is settled.
    struct Tally {
        seen: i64,
        stop_on: Option<&'static str>,
        finished: Arc<AtomicUsize>,
    }

    impl StreamAccountant for Tally {
        fn observe(&mut self, event: &SseEvent) -> Flow {
            self.seen += 1;
            match self.stop_on {
                Some(word) if event.data == word => Flow::Stop,
                _ => Flow::Continue,
            }
        }

        fn finish(&mut self) -> Usage {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Usage {
                completion_tokens: self.seen,
                ..Default::default()
            }
        }
    }

    fn scope() -> Arc<RequestScope> {
        Arc::new(RequestScope::new("r", "POST", "/x", "", Duration::from_secs(5)))
    }

    fn tally(stop_on: Option<&'static str>) -> (Box<Tally>, Arc<AtomicUsize>) {
        let finished = Arc::new(AtomicUsize::new(0));
        let t = Box::new(Tally {
            seen: 0,
            stop_on,
            finished: finished.clone(),
        });
        (t, finished)
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_forwards_and_settles_once() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from("data: a\n\nda")),
            Ok(Bytes::from("ta: b\n\n")),
        ];
        let scope = scope();
        let (acct, finished) = tally(None);
        let s = AccountingStream::new(stream::iter(chunks), acct, scope.clone(), far());
        let out: Vec<_> = s.map(|r| r.unwrap()).collect().await;

        assert_eq!(out, vec![Bytes::from("data: a\n\n"), Bytes::from("data: b\n\n")]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(scope.snapshot().completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_stop_ends_after_forwarding() {
        let chunks: Vec<Result<Bytes, String>> =
            vec![Ok(Bytes::from("data: a\n\ndata: END\n\ndata: late\n\n"))];
        let (acct, finished) = tally(Some("END"));
        let s = AccountingStream::new(stream::iter(chunks), acct, scope(), far());
        let out: Vec<_> = s.collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_becomes_error_event() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from("data: a\n\n")),
            Err("connection reset".to_string()),
        ];
        let (acct, finished) = tally(None);
        let s = AccountingStream::new(stream::iter(chunks), acct, scope(), far());
        let out: Vec<_> = s.map(|r| r.unwrap()).collect().await;

        assert_eq!(out.len(), 2);
        let last = String::from_utf8(out[1].to_vec()).unwrap();
        assert!(last.starts_with("event: error\n"));
        assert!(last.contains("connection reset"));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_ends_stream() {
        let (acct, finished) = tally(None);
        let s = AccountingStream::new(
            stream::pending::<Result<Bytes, String>>(),
            acct,
            scope(),
            Instant::now() + Duration::from_millis(20),
        );
        let out: Vec<_> = s.collect().await;
        assert!(out.is_empty());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_midway_settles() {
        let chunks: Vec<Result<Bytes, String>> = vec![Ok(Bytes::from("data: a\n\n"))];
        let scope = scope();
        let (acct, finished) = tally(None);
        let mut s = Box::pin(AccountingStream::new(
            stream::iter(chunks).chain(stream::pending()),
            acct,
            scope.clone(),
            far(),
        ));
        assert!(s.next().await.is_some());
        drop(s);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(scope.snapshot().completion_tokens, 1);
    }
}
