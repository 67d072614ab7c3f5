//! Shared networking infrastructure.

pub mod client;
pub mod sse;

pub use client::{HttpClient, HttpClientBuilder};
pub use sse::{SseEvent, SseStream};
