use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use axum::response::Response;
use bytes::Bytes;
use serde_json::{Map, Value, json};

use crate::bridge::{self, Call, Upstreams};
use crate::error::AppError;
use crate::mirror::Mirror;
use crate::proxy::inspect::{InspectRequest, Inspector};
use crate::proxy::scope::RequestScope;
use crate::store::{ApiKey, ProviderSetting, Route, Step};

const FORMAT_EMBEDDINGS: &str = "embeddings";

/// Default `max_tokens` when a chat request is sent to Anthropic, which
/// requires the field.
const ANTHROPIC_MAX_TOKENS: u64 = 1024;

fn is_embeddings(request_format: &str) -> bool {
    request_format == FORMAT_EMBEDDINGS
}

/// Provider-relative path a step is sent to. Formats other than
/// `embeddings` (including `chat_completion` and none) are chat requests.
pub fn step_path(provider: &str, request_format: &str, model: &str) -> String {
    let embeddings = is_embeddings(request_format);
    match provider {
        "azure" if embeddings => format!("/openai/deployments/{model}/embeddings"),
        "azure" => format!("/openai/deployments/{model}/chat/completions"),
        "anthropic" => "/v1/messages".to_string(),
        "bedrock" => "/anthropic/v1/messages".to_string(),
        _ if embeddings => "/v1/embeddings".to_string(),
        _ => "/v1/chat/completions".to_string(),
    }
}

/// A route invocation, after admission.
pub struct RouteRequest<'a> {
    pub scope: &'a Arc<RequestScope>,
    pub key: &'a ApiKey,
    pub route: &'a Route,
    pub headers: &'a HeaderMap,
    pub json: Option<&'a Value>,
}

/// Try each step in order and return the first 200. When every step fails
/// the last step's response (or error) is returned. Responses are relayed
/// in the serving provider's own shape.
pub async fn execute(
    up: &Upstreams,
    mirror: &Mirror,
    req: RouteRequest<'_>,
) -> Result<Response, AppError> {
    let mut last: Result<Response, AppError> = Err(AppError::NotFound(format!(
        "route {} has no steps",
        req.route.path
    )));

    for (i, step) in req.route.steps.iter().enumerate() {
        let call = match prepare(up, mirror, &req, step) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(route = %req.route.path, step = i, provider = %step.provider, error = %e, "Skipping route step");
                last = Err(e);
                continue;
            }
        };

        req.scope.set_served_by(&step.provider, &step.model);
        req.scope.update(|s| s.setting = Some(call.setting.clone()));

        match bridge::forward(up, call).await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(route = %req.route.path, step = i, provider = %step.provider, "Route step succeeded");
                return Ok(resp);
            }
            Ok(resp) => {
                tracing::warn!(route = %req.route.path, step = i, provider = %step.provider, status = resp.status().as_u16(), "Route step failed");
                up.telemetry
                    .incr("route.fallback", &[("provider", step.provider.as_str())], 1.0);
                last = Ok(resp);
            }
            Err(e) => {
                tracing::warn!(route = %req.route.path, step = i, provider = %step.provider, error = %e, "Route step errored");
                up.telemetry
                    .incr("route.fallback", &[("provider", step.provider.as_str())], 1.0);
                last = Err(e);
            }
        }
    }
    last
}

/// Credentials for a step: the first of the key's settings for its provider.
fn step_setting(
    mirror: &Mirror,
    key: &ApiKey,
    step: &Step,
) -> Result<Arc<ProviderSetting>, AppError> {
    key.all_setting_ids()
        .filter_map(|id| mirror.setting(id))
        .find(|s| s.provider == step.provider)
        .ok_or_else(|| {
            AppError::Forbidden(format!("key has no setting for provider {}", step.provider))
        })
}

fn prepare(
    up: &Upstreams,
    mirror: &Mirror,
    req: &RouteRequest<'_>,
    step: &Step,
) -> Result<Call, AppError> {
    let format = req.route.request_format.as_str();
    let anthropic_shaped = matches!(step.provider.as_str(), "anthropic" | "bedrock");
    if is_embeddings(format) && anthropic_shaped {
        return Err(AppError::BadRequest(format!(
            "{} does not serve embeddings",
            step.provider
        )));
    }

    let setting = step_setting(mirror, req.key, step)?;
    let path = step_path(&step.provider, format, &step.model);

    let mut body = match req.json {
        Some(Value::Object(obj)) => obj.clone(),
        Some(_) => return Err(AppError::BadRequest("request body must be a JSON object".into())),
        None => Map::new(),
    };
    body.insert("model".into(), Value::String(step.model.clone()));
    for (k, v) in &step.params {
        body.insert(k.clone(), v.clone());
    }
    let body = if anthropic_shaped {
        to_messages_api(body)
    } else {
        Value::Object(body)
    };
    let stream = body["stream"].as_bool().unwrap_or(false);

    let inspector = Inspector {
        estimator: &up.estimator,
        telemetry: up.telemetry.as_ref(),
    };
    let inspection = inspector.inspect(&InspectRequest {
        provider: &step.provider,
        rest: &path,
        json: Some(&body),
        multipart: None,
        route_config: None,
        overrides: setting.cost_map.as_ref(),
    });

    Ok(Call {
        scope: req.scope.clone(),
        provider: step.provider.clone(),
        setting,
        method: Method::POST,
        path,
        query: None,
        headers: req.headers.clone(),
        body: Bytes::from(serde_json::to_vec(&body)?),
        json: Some(body),
        multipart: None,
        model: step.model.clone(),
        stream,
        prompt_tokens: inspection.prompt_tokens,
        route_config: None,
        auth_param: String::new(),
    })
}

/// Reshape an OpenAI chat body for the Anthropic messages API: system
/// messages move to `system` and `max_tokens` becomes mandatory.
fn to_messages_api(mut body: Map<String, Value>) -> Value {
    let mut system = Vec::new();
    let mut messages = Vec::new();
    if let Some(Value::Array(items)) = body.remove("messages") {
        for m in items {
            if m["role"] == "system" {
                if let Some(text) = m["content"].as_str() {
                    system.push(text.to_string());
                }
            } else {
                messages.push(json!({
                    "role": m["role"].clone(),
                    "content": m["content"].clone(),
                }));
            }
        }
    }
    body.insert("messages".into(), Value::Array(messages));
    if !system.is_empty() && !body.contains_key("system") {
        body.insert("system".into(), Value::String(system.join("\n")));
    }
    if let Some(max) = body.remove("max_completion_tokens") {
        body.entry("max_tokens").or_insert(max);
    }
    body.entry("max_tokens")
        .or_insert_with(|| Value::from(ANTHROPIC_MAX_TOKENS));
    for openai_only in ["n", "presence_penalty", "frequency_penalty", "logit_bias", "user"] {
        body.remove(openai_only);
    }
    Value::Object(body)
}
