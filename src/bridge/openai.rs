//! OpenAI, and the usage readers every OpenAI-shaped provider shares.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde_json::Value;

use super::{Call, Flow, HttpBridge, Pricer, StreamAccountant, Upstreams, as_i64, header_value};
use crate::error::AppError;
use crate::net::SseEvent;
use crate::proxy::scope::Usage;

pub struct OpenAi;

impl HttpBridge for OpenAi {
    fn url(&self, up: &Upstreams, call: &Call) -> Result<String, AppError> {
        Ok(format!(
            "{}{}",
            up.config.openai.trim_end_matches('/'),
            call.path_and_query()
        ))
    }

    fn authorize(&self, _: &Upstreams, call: &Call, headers: &mut HeaderMap) -> Result<(), AppError> {
        bearer(headers, call.api_key()?)
    }

    fn unary_usage(&self, pricer: &Pricer, call: &Call, body: &Value) -> Usage {
        unary_usage(pricer, call, body, ModelSource::Request)
    }

    fn accountant(&self, pricer: Pricer, call: &Call) -> Box<dyn StreamAccountant> {
        Box::new(ChunkAccountant::new(pricer, call, ModelSource::Request))
    }
}

pub(crate) fn bearer(headers: &mut HeaderMap, token: &str) -> Result<(), AppError> {
    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
    Ok(())
}

/// Which model name to price with when request and response disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModelSource {
    Request,
    /// Azure deployments report the underlying model.
    Response,
}

fn pick_model(source: ModelSource, requested: &str, reported: Option<&str>) -> String {
    let reported = reported.filter(|m| !m.is_empty());
    match (source, reported) {
        (ModelSource::Response, Some(m)) => m.to_string(),
        _ if !requested.is_empty() => requested.to_string(),
        (_, Some(m)) => m.to_string(),
        _ => String::new(),
    }
}

fn is_priced_path(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    path.ends_with("/chat/completions") || path.ends_with("/completions")
}

/// Generated text in a chat or legacy completion response.
fn choices_text(body: &Value) -> String {
    let mut out = String::new();
    for choice in body["choices"].as_array().into_iter().flatten() {
        if let Some(t) = choice["message"]["content"].as_str() {
            out.push_str(t);
        }
        if let Some(t) = choice["text"].as_str() {
            out.push_str(t);
        }
        for call in choice["message"]["tool_calls"].as_array().into_iter().flatten() {
            if let Some(args) = call["function"]["arguments"].as_str() {
                out.push_str(args);
            }
        }
    }
    out
}

pub(crate) fn unary_usage(pricer: &Pricer, call: &Call, body: &Value, source: ModelSource) -> Usage {
    let model = pick_model(source, &call.model, body["model"].as_str());
    let usage = body.get("usage");
    let prompt_tokens = as_i64(usage.and_then(|u| u.get("prompt_tokens"))).unwrap_or(call.prompt_tokens);

    if call.is_embeddings() {
        return pricer.embeddings_usage(&model, prompt_tokens);
    }
    if !is_priced_path(&call.path) {
        return Usage {
            model,
            prompt_tokens,
            ..Default::default()
        };
    }

    let completion_tokens = as_i64(usage.and_then(|u| u.get("completion_tokens")))
        .unwrap_or_else(|| pricer.count(&model, &choices_text(body)));
    pricer.usage(&model, prompt_tokens, completion_tokens)
}

/// Accumulates `chat.completion.chunk` deltas. A trailing `usage` object
/// (`stream_options.include_usage`) wins over local counting.
pub(crate) struct ChunkAccountant {
    pricer: Pricer,
    source: ModelSource,
    requested: String,
    reported: Option<String>,
    prompt_tokens: i64,
    text: String,
    usage: Option<(i64, i64)>,
}

impl ChunkAccountant {
    pub(crate) fn new(pricer: Pricer, call: &Call, source: ModelSource) -> Self {
        Self {
            pricer,
            source,
            requested: call.model.clone(),
            reported: None,
            prompt_tokens: call.prompt_tokens,
            text: String::new(),
            usage: None,
        }
    }
}

impl StreamAccountant for ChunkAccountant {
    fn observe(&mut self, event: &SseEvent) -> Flow {
        if event.is_done() {
            return Flow::Stop;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(&event.data) else {
            return Flow::Continue;
        };

        if self.reported.is_none() {
            self.reported = chunk["model"].as_str().map(String::from);
        }
        for choice in chunk["choices"].as_array().into_iter().flatten() {
            if let Some(t) = choice["delta"]["content"].as_str() {
                self.text.push_str(t);
            }
            if let Some(t) = choice["text"].as_str() {
                self.text.push_str(t);
            }
            for call in choice["delta"]["tool_calls"].as_array().into_iter().flatten() {
                if let Some(args) = call["function"]["arguments"].as_str() {
                    self.text.push_str(args);
                }
            }
        }
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            if let (Some(p), Some(c)) = (
                as_i64(usage.get("prompt_tokens")),
                as_i64(usage.get("completion_tokens")),
            ) {
                self.usage = Some((p, c));
            }
        }
        Flow::Continue
    }

    fn finish(&mut self) -> Usage {
        let model = pick_model(self.source, &self.requested, self.reported.as_deref());
        let (p, c) = self
            .usage
            .unwrap_or_else(|| (self.prompt_tokens, self.pricer.count(&model, &self.text)));
        self.pricer.usage(&model, p, c)
    }
}
