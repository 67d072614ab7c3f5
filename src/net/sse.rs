//! Server-Sent Events framing.
//!
//! Splits a byte stream into events on blank lines. Each event keeps the raw
//! block it was parsed from so a relay can forward it byte-for-byte.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;
use pin_project_lite::pin_project;

pin_project! {
    /// Consumes a stream of bytes and yields parsed SSE events.
    pub struct SseStream<S> {
        #[pin]
        byte_stream: S,
        buffer: Vec<u8>,
        pending_events: VecDeque<SseEvent>,
        done: bool,
    }
}

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// The block as received, without the terminating blank line.
    pub raw: String,
}

impl SseEvent {
    /// `data: ...` event with no type.
    pub fn data(data: impl Into<String>) -> Self {
        let data = data.into();
        let raw = encode_block(None, &data);
        Self {
            data,
            raw,
            ..Default::default()
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        let event = event.into();
        let data = data.into();
        let raw = encode_block(Some(&event), &data);
        Self {
            event: Some(event),
            data,
            raw,
            ..Default::default()
        }
    }

    /// `data: [DONE]`, the OpenAI end-of-stream marker.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Wire bytes including the terminating blank line.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(format!("{}\n\n", self.raw))
    }
}

fn encode_block(event: Option<&str>, data: &str) -> String {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    let mut lines = data.split('\n').peekable();
    while let Some(line) = lines.next() {
        out.push_str("data: ");
        out.push_str(line);
        if lines.peek().is_some() {
            out.push('\n');
        }
    }
    out
}

impl<S> SseStream<S> {
    pub fn new(byte_stream: S) -> Self {
        Self {
            byte_stream,
            buffer: Vec::new(),
            pending_events: VecDeque::new(),
            done: false,
        }
    }
}

/// Position and length of the first blank-line separator.
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
        i += 1;
    }
    None
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<SseEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if let Some(event) = this.pending_events.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }
        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.byte_stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);

                    while let Some((pos, sep)) = find_separator(this.buffer) {
                        let block: Vec<u8> = this.buffer.drain(..pos + sep).take(pos).collect();
                        if let Some(event) = parse_sse_block(&String::from_utf8_lossy(&block)) {
                            this.pending_events.push_back(event);
                        }
                    }

                    if let Some(event) = this.pending_events.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    *this.done = true;
                    if !this.buffer.is_empty() {
                        let rest = std::mem::take(this.buffer);
                        if let Some(event) = parse_sse_block(&String::from_utf8_lossy(&rest)) {
                            this.pending_events.push_back(event);
                        }
                    }
                    return Poll::Ready(this.pending_events.pop_front().map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub fn parse_sse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data = String::new();
    let mut has_data = false;
    let mut id = None;

    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("data:") {
            if has_data {
                data.push('\n');
            }
            has_data = true;
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }

    if !has_data && event.is_none() && id.is_none() {
        return None;
    }

    Some(SseEvent {
        event,
        data,
        id,
        raw: block.trim_end_matches(['\r', '\n']).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::stream;
    use std::convert::Infallible;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, Infallible>> {
        stream::iter(parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_sse_parsing() {
        let mut sse = SseStream::new(chunks(&["data: hello\n\ndata: world\nevent: message\n\n"]));

        let event1 = sse.next().await.unwrap().unwrap();
        assert_eq!(event1.data, "hello");

        let event2 = sse.next().await.unwrap().unwrap();
        assert_eq!(event2.data, "world");
        assert_eq!(event2.event.as_deref(), Some("message"));
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let mut sse = SseStream::new(chunks(&[
            "event: completion\nda",
            "ta: {\"completion\":\" hi\"}\n",
            "\n",
        ]));
        let ev = sse.next().await.unwrap().unwrap();
        assert_eq!(ev.event.as_deref(), Some("completion"));
        assert_eq!(ev.data, "{\"completion\":\" hi\"}");
        assert_eq!(
            ev.to_bytes(),
            Bytes::from_static(b"event: completion\ndata: {\"completion\":\" hi\"}\n\n")
        );
    }

    #[tokio::test]
    async fn test_crlf_and_trailing_block() {
        let mut sse = SseStream::new(chunks(&["data: a\r\n\r\ndata: [DONE]"]));
        assert_eq!(sse.next().await.unwrap().unwrap().data, "a");
        let last = sse.next().await.unwrap().unwrap();
        assert!(last.is_done());
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn test_multibyte_split() {
        let bytes = "data: héllo\n\n".as_bytes();
        let (a, b) = bytes.split_at(8);
        let parts = vec![
            Ok::<_, Infallible>(Bytes::copy_from_slice(a)),
            Ok(Bytes::copy_from_slice(b)),
        ];
        let mut sse = SseStream::new(stream::iter(parts));
        assert_eq!(sse.next().await.unwrap().unwrap().data, "héllo");
    }

    #[test]
    fn test_constructed_events_encode() {
        assert_eq!(SseEvent::data("x").to_bytes(), Bytes::from_static(b"data: x\n\n"));
        let err = SseEvent::named("error", "{\"m\":1}");
        assert_eq!(err.raw, "event: error\ndata: {\"m\":1}");
        assert!(parse_sse_block(": keepalive").is_none());
    }
}
