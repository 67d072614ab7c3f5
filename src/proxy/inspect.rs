//! Request classification and body inspection.
//!
//! Before a request is admitted the gateway needs to know which provider it
//! targets, which model it asks for, whether it streams, and roughly what
//! the prompt will cost. Estimation failures never deny a request; they
//! price the prompt at zero.

use serde_json::Value;

use super::jsonpath;
use super::multipart::{self, MultipartPart};
use crate::bridge::azure;
use crate::estimator::{ChatCompletionRequest, Estimator, EstimatorError};
use crate::store::{CostMap, RouteConfig};
use crate::telemetry::Telemetry;

const PROVIDER_PREFIX: &str = "/api/providers/";
const CUSTOM_PREFIX: &str = "/api/custom/providers/";
const ROUTE_PREFIX: &str = "/api/routes";

/// Where a proxied path is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `/api/providers/{provider}{rest}`
    Provider { provider: String, rest: String },
    /// `/api/custom/providers/{name}{rest}`
    Custom { name: String, rest: String },
    /// `/api/routes{path}`
    Route { path: String },
    Unknown,
}

impl Target {
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Provider { provider, .. } => Some(provider),
            Self::Custom { name, .. } => Some(name),
            _ => None,
        }
    }
}

fn split_first(rest: &str) -> Option<(String, String)> {
    let (head, tail) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    (!head.is_empty()).then(|| (head.to_string(), tail.to_string()))
}

pub fn classify(path: &str) -> Target {
    if let Some(rest) = path.strip_prefix(CUSTOM_PREFIX) {
        return split_first(rest)
            .map(|(name, rest)| Target::Custom { name, rest })
            .unwrap_or(Target::Unknown);
    }
    if let Some(rest) = path.strip_prefix(PROVIDER_PREFIX) {
        return split_first(rest)
            .map(|(provider, rest)| Target::Provider { provider, rest })
            .unwrap_or(Target::Unknown);
    }
    match path.strip_prefix(ROUTE_PREFIX) {
        Some(rest) if rest.len() > 1 && rest.starts_with('/') => Target::Route {
            path: rest.to_string(),
        },
        _ => Target::Unknown,
    }
}

/// What the body says about the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inspection {
    pub model: String,
    pub stream: bool,
    pub prompt: String,
    pub prompt_tokens: i64,
    pub prompt_cost: f64,
}

/// Everything inspection reads.
pub struct InspectRequest<'a> {
    pub provider: &'a str,
    pub rest: &'a str,
    pub json: Option<&'a Value>,
    pub multipart: Option<&'a [MultipartPart]>,
    pub route_config: Option<&'a RouteConfig>,
    pub overrides: Option<&'a CostMap>,
}

pub struct Inspector<'a> {
    pub estimator: &'a Estimator,
    pub telemetry: &'a dyn Telemetry,
}

/// Joined text of a string or an array of strings.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Embedding inputs may be pre-tokenized (`[1, 2, 3]` or `[[1, 2], [3]]`).
fn pretokenized_len(value: &Value) -> Option<i64> {
    let items = value.as_array()?;
    if items.iter().all(Value::is_number) {
        return Some(items.len() as i64);
    }
    items
        .iter()
        .map(|i| i.as_array().filter(|a| a.iter().all(Value::is_number)).map(|a| a.len() as i64))
        .sum()
}

fn messages_text(body: &Value) -> String {
    let mut parts = Vec::new();
    let system = crate::bridge::anthropic::content_text(&body["system"]);
    if !system.is_empty() {
        parts.push(system);
    }
    for message in body["messages"].as_array().into_iter().flatten() {
        let text = crate::bridge::anthropic::content_text(&message["content"]);
        if !text.is_empty() {
            parts.push(text);
        }
    }
    parts.join("\n")
}

impl Inspector<'_> {
    fn priced(&self, req: &InspectRequest<'_>, model: &str, cost: Result<f64, EstimatorError>) -> f64 {
        if !self.estimator.is_priced(req.provider, req.overrides) {
            return 0.0;
        }
        cost.unwrap_or_else(|e| {
            tracing::debug!(provider = req.provider, model, error = %e, "Prompt cost unavailable");
            self.telemetry
                .incr("estimator.error", &[("provider", req.provider)], 1.0);
            0.0
        })
    }

    pub fn inspect(&self, req: &InspectRequest<'_>) -> Inspection {
        if let Some(parts) = req.multipart {
            return Inspection {
                model: multipart::field(parts, "model")
                    .map(MultipartPart::text)
                    .unwrap_or_default(),
                ..Default::default()
            };
        }

        if let Some(rc) = req.route_config {
            return self.inspect_custom(req, rc);
        }

        let null = Value::Null;
        let body = req.json.unwrap_or(&null);
        let mut out = Inspection {
            model: body["model"].as_str().unwrap_or_default().to_string(),
            stream: body["stream"].as_bool().unwrap_or(false),
            ..Default::default()
        };
        if req.provider == "azure" && out.model.is_empty() {
            out.model = azure::deployment(req.rest).unwrap_or_default().to_string();
        }

        let path = req.rest.trim_end_matches('/');
        match req.provider {
            "anthropic" | "bedrock" => {
                out.prompt = if path.ends_with("/complete") {
                    body["prompt"].as_str().unwrap_or_default().to_string()
                } else if path.ends_with("/messages") {
                    messages_text(body)
                } else {
                    return out;
                };
                out.prompt_tokens = self.estimator.count_anthropic_tokens(&out.prompt);
                let cost = self.estimator.prompt_cost(
                    req.provider,
                    &out.model,
                    out.prompt_tokens,
                    req.overrides,
                );
                out.prompt_cost = self.priced(req, &out.model, cost);
            }
            _ if path.ends_with("/chat/completions") => {
                match serde_json::from_value::<ChatCompletionRequest>(body.clone()) {
                    Ok(mut chat) => {
                        chat.model = out.model.clone();
                        let (tokens, cost) =
                            self.estimator.chat_prompt_cost(req.provider, &chat, req.overrides);
                        out.prompt_tokens = tokens;
                        out.prompt_cost = self.priced(req, &out.model, cost);
                    }
                    Err(e) => tracing::debug!(error = %e, "Chat body did not parse for estimation"),
                }
            }
            _ if path.ends_with("/completions") => {
                out.prompt = text_of(&body["prompt"]);
                out.prompt_tokens = self.estimator.count_tokens(&out.model, &out.prompt);
                let cost = self.estimator.prompt_cost(
                    req.provider,
                    &out.model,
                    out.prompt_tokens,
                    req.overrides,
                );
                out.prompt_cost = self.priced(req, &out.model, cost);
            }
            _ if path.ends_with("/embeddings") => {
                let input = &body["input"];
                out.prompt_tokens = pretokenized_len(input)
                    .unwrap_or_else(|| self.estimator.count_tokens(&out.model, &text_of(input)));
                let cost = self.estimator.embeddings_cost(
                    req.provider,
                    &out.model,
                    out.prompt_tokens,
                    req.overrides,
                );
                out.prompt_cost = self.priced(req, &out.model, cost);
            }
            _ => {}
        }
        out
    }

    fn inspect_custom(&self, req: &InspectRequest<'_>, rc: &RouteConfig) -> Inspection {
        let null = Value::Null;
        let body = req.json.unwrap_or(&null);
        let model = jsonpath::lookup_text(body, &rc.model_location).unwrap_or_default();
        let prompt = jsonpath::lookup_text(body, &rc.request_prompt_location).unwrap_or_default();
        let prompt_tokens = self.estimator.count_anthropic_tokens(&prompt);
        let cost = self
            .estimator
            .prompt_cost(req.provider, &model, prompt_tokens, req.overrides);
        Inspection {
            stream: jsonpath::lookup_bool(body, &rc.stream_location),
            prompt_cost: self.priced(req, &model, cost),
            model,
            prompt,
            prompt_tokens,
        }
    }
}
