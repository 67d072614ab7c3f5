//! Anthropic, for both the legacy `/v1/complete` and the `/v1/messages`
//! APIs. Bedrock's Claude models return the same shapes and reuse the
//! readers here.

use axum::http::HeaderMap;
use serde_json::Value;

use super::{Call, Flow, HttpBridge, Pricer, StreamAccountant, Upstreams, as_i64, header_value};
use crate::error::AppError;
use crate::net::SseEvent;
use crate::proxy::scope::Usage;

/// Added to locally counted streaming usage when the upstream reported
/// nothing, to cover the framing tokens Anthropic bills for.
const PROMPT_OVERHEAD: i64 = 1;
const COMPLETION_OVERHEAD: i64 = 4;

pub struct Anthropic;

impl HttpBridge for Anthropic {
    fn url(&self, up: &Upstreams, call: &Call) -> Result<String, AppError> {
        Ok(format!(
            "{}{}",
            up.config.anthropic.trim_end_matches('/'),
            call.path_and_query()
        ))
    }

    fn authorize(&self, up: &Upstreams, call: &Call, headers: &mut HeaderMap) -> Result<(), AppError> {
        headers.insert("x-api-key", header_value(call.api_key()?)?);
        if !headers.contains_key("anthropic-version") {
            headers.insert("anthropic-version", header_value(&up.config.anthropic_version)?);
        }
        Ok(())
    }

    fn unary_usage(&self, pricer: &Pricer, call: &Call, body: &Value) -> Usage {
        unary_usage(pricer, call, body)
    }

    fn accountant(&self, pricer: Pricer, call: &Call) -> Box<dyn StreamAccountant> {
        Box::new(EventAccountant::new(pricer, call))
    }
}

/// Text of a messages-API `content` array.
pub(crate) fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

pub(crate) fn unary_usage(pricer: &Pricer, call: &Call, body: &Value) -> Usage {
    let model = if call.model.is_empty() {
        body["model"].as_str().unwrap_or_default().to_string()
    } else {
        call.model.clone()
    };

    if let Some(completion) = body["completion"].as_str() {
        let completion_tokens = pricer.count_anthropic(completion);
        return pricer.usage(&model, call.prompt_tokens, completion_tokens);
    }

    let usage = &body["usage"];
    let prompt_tokens = as_i64(usage.get("input_tokens")).unwrap_or(call.prompt_tokens);
    let completion_tokens = as_i64(usage.get("output_tokens"))
        .unwrap_or_else(|| pricer.count_anthropic(&content_text(&body["content"])));
    pricer.usage(&model, prompt_tokens, completion_tokens)
}

/// Reads `completion`, `message_start`, `content_block_delta` and
/// `message_delta` events, plus Bedrock's invocation metrics.
pub(crate) struct EventAccountant {
    pricer: Pricer,
    model: String,
    prompt_tokens: i64,
    text: String,
    input: Option<i64>,
    output: Option<i64>,
    metrics: Option<(i64, i64)>,
}

impl EventAccountant {
    pub(crate) fn new(pricer: Pricer, call: &Call) -> Self {
        Self {
            pricer,
            model: call.model.clone(),
            prompt_tokens: call.prompt_tokens,
            text: String::new(),
            input: None,
            output: None,
            metrics: None,
        }
    }
}

impl StreamAccountant for EventAccountant {
    fn observe(&mut self, event: &SseEvent) -> Flow {
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            return Flow::Continue;
        };

        let kind = data["type"]
            .as_str()
            .or(event.event.as_deref())
            .unwrap_or_default();
        match kind {
            "completion" => {
                if let Some(t) = data["completion"].as_str() {
                    self.text.push_str(t);
                }
            }
            "message_start" => {
                let message = &data["message"];
                if self.model.is_empty() {
                    self.model = message["model"].as_str().unwrap_or_default().to_string();
                }
                self.input = as_i64(message["usage"].get("input_tokens")).or(self.input);
                self.output = as_i64(message["usage"].get("output_tokens")).or(self.output);
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                if let Some(t) = delta["text"].as_str().or(delta["partial_json"].as_str()) {
                    self.text.push_str(t);
                }
            }
            "message_delta" => {
                self.output = as_i64(data["usage"].get("output_tokens")).or(self.output);
            }
            _ => {}
        }

        let metrics = &data["amazon-bedrock-invocationMetrics"];
        if let (Some(i), Some(o)) = (
            as_i64(metrics.get("inputTokenCount")),
            as_i64(metrics.get("outputTokenCount")),
        ) {
            self.metrics = Some((i, o));
        }
        Flow::Continue
    }

    fn finish(&mut self) -> Usage {
        let (p, c) = match (self.metrics, self.input, self.output) {
            (Some(m), _, _) => m,
            (None, Some(i), Some(o)) if o > 0 || self.text.is_empty() => (i, o),
            (None, input, _) => (
                input.unwrap_or(self.prompt_tokens + PROMPT_OVERHEAD),
                self.pricer.count_anthropic(&self.text) + COMPLETION_OVERHEAD,
            ),
        };
        self.pricer.usage(&self.model, p, c)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::bridge::{forward, testing};
    use crate::config::UpstreamsConfig;

    fn upstreams(base: &str) -> Upstreams {
        testing::upstreams(UpstreamsConfig {
            anthropic: base.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_messages_usage_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ant-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-3-haiku-20240307",
                "content": [{"type": "text", "text": "hi"}],
                "usage": {"input_tokens": 1000, "output_tokens": 1000}
            })))
            .mount(&server)
            .await;

        let up = upstreams(&server.uri());
        let setting = testing::setting("anthropic", &[("apikey", "ant-key")]);
        let call = testing::call(
            "anthropic",
            setting,
            "/v1/messages",
            json!({"model": "claude-3-haiku-20240307", "max_tokens": 10, "messages": []}),
        );
        let scope = call.scope.clone();

        let resp = forward(&up, call).await.unwrap();
        assert_eq!(resp.status(), 200);
        let s = scope.snapshot();
        assert_eq!((s.prompt_tokens, s.completion_tokens), (1000, 1000));
        assert!((s.cost_in_usd - 0.0015).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_legacy_complete_counts_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/complete"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"completion": " Hello there", "model": "claude-2"})),
            )
            .mount(&server)
            .await;

        let up = upstreams(&server.uri());
        let setting = testing::setting("anthropic", &[("apikey", "ant-key")]);
        let mut call = testing::call("anthropic", setting, "/v1/complete", json!({"model": "claude-2"}));
        call.prompt_tokens = 12;
        let scope = call.scope.clone();

        forward(&up, call).await.unwrap();
        let s = scope.snapshot();
        assert_eq!(s.prompt_tokens, 12);
        assert_eq!(s.completion_tokens, 2);
    }

    #[test]
    fn test_stream_prefers_reported_usage() {
        let up = upstreams("http://unused");
        let setting = testing::setting("anthropic", &[("apikey", "k")]);
        let call = testing::call(
            "anthropic",
            setting,
            "/v1/messages",
            json!({"model": "claude-3-opus-20240229", "stream": true}),
        );
        let mut acct = EventAccountant::new(up.pricer(&call), &call);
        let events = [
            SseEvent::named(
                "message_start",
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 25, "output_tokens": 1}}}).to_string(),
            ),
            SseEvent::named(
                "content_block_delta",
                json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hello"}}).to_string(),
            ),
            SseEvent::named(
                "message_delta",
                json!({"type": "message_delta", "usage": {"output_tokens": 15}}).to_string(),
            ),
        ];
        for ev in &events {
            acct.observe(ev);
        }
        let usage = acct.finish();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (25, 15));
    }

    #[test]
    fn test_stream_counts_locally_with_overhead() {
        let up = upstreams("http://unused");
        let setting = testing::setting("anthropic", &[("apikey", "k")]);
        let mut call = testing::call("anthropic", setting, "/v1/complete", json!({"model": "claude-2"}));
        call.prompt_tokens = 10;
        let mut acct = EventAccountant::new(up.pricer(&call), &call);
        acct.observe(&SseEvent::named(
            "completion",
            json!({"type": "completion", "completion": " Hello"}).to_string(),
        ));
        let usage = acct.finish();
        assert_eq!(usage.prompt_tokens, 10 + PROMPT_OVERHEAD);
        assert_eq!(usage.completion_tokens, 1 + COMPLETION_OVERHEAD);
    }

    #[test]
    fn test_bedrock_metrics_win() {
        let up = upstreams("http://unused");
        let setting = testing::setting("bedrock", &[]);
        let call = testing::call("bedrock", setting, "/anthropic/v1/messages", json!({}));
        let mut acct = EventAccountant::new(up.pricer(&call), &call);
        acct.observe(&SseEvent::named(
            "message_stop",
            json!({
                "type": "message_stop",
                "amazon-bedrock-invocationMetrics": {"inputTokenCount": 7, "outputTokenCount": 9}
            })
            .to_string(),
        ));
        let usage = acct.finish();
        assert_eq!((usage.prompt_tokens, usage.completion_tokens), (7, 9));
    }
}
