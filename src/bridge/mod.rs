//! Upstream bridges.
//!
//! Every HTTP provider implements [`HttpBridge`]: where to send the request,
//! how to authenticate it, and how to read usage out of a unary body or a
//! streamed one. [`relay`] does the rest (header hygiene, deadlines, the
//! unary/streaming split and writing usage into the request scope). Bedrock
//! speaks the AWS SDK instead of HTTP and has its own forwarder.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod compat;
pub mod custom;
pub mod openai;
pub mod stream;

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;
use tokio::time::{Instant, timeout_at};

use crate::config::UpstreamsConfig;
use crate::error::AppError;
use crate::estimator::{Estimator, EstimatorError};
use crate::net::{HttpClient, SseEvent};
use crate::proxy::emitter::StreamingResponse;
use crate::proxy::multipart::{self, MultipartPart};
use crate::proxy::scope::{RequestScope, Usage};
use crate::store::{CostMap, ProviderSetting, RouteConfig};
use crate::telemetry::Telemetry;

pub use self::bedrock::BedrockClients;
pub use self::stream::AccountingStream;

// ---------------------------------------------------------------------------
// Shared upstream context
// ---------------------------------------------------------------------------

pub struct Upstreams {
    pub client: HttpClient,
    pub estimator: Arc<Estimator>,
    pub telemetry: Arc<dyn Telemetry>,
    pub config: UpstreamsConfig,
    pub strip_user_agent: bool,
    /// Whether keys that ask for it may have response bodies logged.
    pub log_bodies: bool,
    pub bedrock: BedrockClients,
}

impl Upstreams {
    pub fn new(
        client: HttpClient,
        estimator: Arc<Estimator>,
        telemetry: Arc<dyn Telemetry>,
        config: UpstreamsConfig,
    ) -> Self {
        let bedrock = BedrockClients::new(config.bedrock_endpoint.clone());
        Self {
            client,
            estimator,
            telemetry,
            config,
            strip_user_agent: false,
            log_bodies: true,
            bedrock,
        }
    }

    pub fn pricer(&self, call: &Call) -> Pricer {
        Pricer {
            estimator: self.estimator.clone(),
            telemetry: self.telemetry.clone(),
            provider: call.provider.clone(),
            overrides: call.setting.cost_map.clone(),
        }
    }
}

/// Token counting and pricing bound to one provider setting. Pricing
/// failures are logged and cost nothing.
#[derive(Clone)]
pub struct Pricer {
    estimator: Arc<Estimator>,
    telemetry: Arc<dyn Telemetry>,
    provider: String,
    overrides: Option<CostMap>,
}

impl Pricer {
    pub fn count(&self, model: &str, text: &str) -> i64 {
        self.estimator.count_tokens(model, text)
    }

    pub fn count_anthropic(&self, text: &str) -> i64 {
        self.estimator.count_anthropic_tokens(text)
    }

    fn price(&self, model: &str, cost: impl FnOnce() -> Result<f64, EstimatorError>) -> f64 {
        if !self.estimator.is_priced(&self.provider, self.overrides.as_ref()) {
            return 0.0;
        }
        cost().unwrap_or_else(|e| {
            tracing::warn!(provider = %self.provider, model, error = %e, "Cost estimation failed");
            self.telemetry
                .incr("estimator.error", &[("provider", self.provider.as_str())], 1.0);
            0.0
        })
    }

    pub fn usage(&self, model: &str, prompt_tokens: i64, completion_tokens: i64) -> Usage {
        let cost_in_usd = self.price(model, || {
            self.estimator.total_cost(
                &self.provider,
                model,
                prompt_tokens,
                completion_tokens,
                self.overrides.as_ref(),
            )
        });
        Usage {
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            cost_in_usd,
        }
    }

    pub fn embeddings_usage(&self, model: &str, prompt_tokens: i64) -> Usage {
        let cost_in_usd = self.price(model, || {
            self.estimator
                .embeddings_cost(&self.provider, model, prompt_tokens, self.overrides.as_ref())
        });
        Usage {
            model: model.to_string(),
            prompt_tokens,
            completion_tokens: 0,
            cost_in_usd,
        }
    }
}

// ---------------------------------------------------------------------------
// One upstream call
// ---------------------------------------------------------------------------

/// A request ready to be forwarded to one provider.
pub struct Call {
    pub scope: Arc<RequestScope>,
    pub provider: String,
    pub setting: Arc<ProviderSetting>,
    pub method: Method,
    /// Provider-relative path, e.g. `/v1/chat/completions`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub json: Option<Value>,
    pub multipart: Option<Vec<MultipartPart>>,
    pub model: String,
    pub stream: bool,
    pub prompt_tokens: i64,
    pub route_config: Option<Arc<RouteConfig>>,
    /// Header custom providers expect the API key in.
    pub auth_param: String,
}

impl Call {
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{q}", self.path),
            _ => self.path.clone(),
        }
    }

    pub fn is_embeddings(&self) -> bool {
        self.path.trim_end_matches('/').ends_with("/embeddings")
    }

    pub fn api_key(&self) -> Result<&str, AppError> {
        self.setting.api_key().ok_or_else(|| {
            AppError::Internal(format!("{} setting has no apikey", self.provider))
        })
    }
}

// ---------------------------------------------------------------------------
// Bridge seams
// ---------------------------------------------------------------------------

pub enum Flow {
    Continue,
    /// Forward this event, then end the stream.
    Stop,
}

/// Watches a relayed event stream and settles usage when it ends.
pub trait StreamAccountant: Send {
    fn observe(&mut self, event: &SseEvent) -> Flow;

    /// Called exactly once, however the stream ended.
    fn finish(&mut self) -> Usage;
}

pub trait HttpBridge: Send + Sync {
    fn url(&self, up: &Upstreams, call: &Call) -> Result<String, AppError>;

    fn authorize(
        &self,
        up: &Upstreams,
        call: &Call,
        headers: &mut HeaderMap,
    ) -> Result<(), AppError>;

    /// Usage from a successful unary response.
    fn unary_usage(&self, pricer: &Pricer, call: &Call, body: &Value) -> Usage;

    fn accountant(&self, pricer: Pricer, call: &Call) -> Box<dyn StreamAccountant>;

    /// Whether a successful response should be relayed as a stream.
    fn streams(&self, call: &Call, content_type: &str) -> bool {
        call.stream && content_type.starts_with("text/event-stream")
    }
}

/// Forward `call` to the bridge for its provider.
pub async fn forward(up: &Upstreams, call: Call) -> Result<Response, AppError> {
    match call.provider.as_str() {
        "openai" => relay(up, &openai::OpenAi, call).await,
        "azure" => relay(up, &azure::Azure, call).await,
        "anthropic" => relay(up, &anthropic::Anthropic, call).await,
        "vllm" => relay(up, &compat::Vllm, call).await,
        "deepinfra" => relay(up, &compat::DeepInfra, call).await,
        "bedrock" => bedrock::forward(up, call).await,
        _ => relay(up, &custom::Custom, call).await,
    }
}

// ---------------------------------------------------------------------------
// Header hygiene
// ---------------------------------------------------------------------------

/// Request headers that never reach the upstream. Credentials are replaced
/// by the bridge; `accept-encoding` is dropped so usage can be read.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    "api-key",
    "x-custom-event-id",
    "x-request-timeout",
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "content-length",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
];

pub fn forward_headers(incoming: &HeaderMap, strip_user_agent: bool, multipart: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in incoming {
        let n = name.as_str();
        if SKIP_REQUEST_HEADERS.contains(&n)
            || (strip_user_agent && n == "user-agent")
            || (multipart && n == "content-type")
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if !SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|_| AppError::Internal("credential is not a valid header value".into()))
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

pub async fn relay(up: &Upstreams, bridge: &dyn HttpBridge, call: Call) -> Result<Response, AppError> {
    let url = bridge.url(up, &call)?;
    let mut headers = forward_headers(&call.headers, up.strip_user_agent, call.multipart.is_some());
    bridge.authorize(up, &call, &mut headers)?;
    if call.stream {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    let deadline = Instant::now() + call.scope.timeout();
    let mut req = up
        .client
        .inner()
        .request(call.method.clone(), &url)
        .headers(headers);
    req = match &call.multipart {
        Some(parts) => {
            let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
            let allowed = multipart::allowed_fields(&call.path).unwrap_or(names.as_slice());
            let form = multipart::build_form(parts, allowed)
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            req.multipart(form)
        }
        None if !call.body.is_empty() => req.body(call.body.clone()),
        None => req,
    };

    tracing::debug!(provider = %call.provider, %url, stream = call.stream, "Forwarding upstream");
    let resp = timeout_at(deadline, req.send())
        .await
        .map_err(|_| AppError::Timeout)??;

    let status = resp.status();
    let headers = relay_headers(resp.headers());
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if status.is_success() && bridge.streams(&call, &content_type) {
        let accountant = bridge.accountant(up.pricer(&call), &call);
        let stream = AccountingStream::new(
            resp.bytes_stream(),
            accountant,
            call.scope.clone(),
            deadline,
        );
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        response.extensions_mut().insert(StreamingResponse);
        return Ok(response);
    }

    let body = timeout_at(deadline, resp.bytes())
        .await
        .map_err(|_| AppError::Timeout)??;

    if status == 200 {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => {
                let usage = bridge.unary_usage(&up.pricer(&call), &call, &value);
                call.scope.record_usage(usage);
            }
            Err(e) => tracing::debug!(provider = %call.provider, error = %e, "Upstream body is not JSON"),
        }
    }
    log_response_body(up, &call, &body);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

pub(crate) fn log_response_body(up: &Upstreams, call: &Call, body: &[u8]) {
    let wants = call.scope.key().is_some_and(|k| k.should_log_response);
    if up.log_bodies && wants {
        tracing::debug!(
            request_id = %call.scope.request_id,
            body = %String::from_utf8_lossy(body),
            "Upstream response body"
        );
    }
}

// ---------------------------------------------------------------------------
// Shared readers
// ---------------------------------------------------------------------------

pub(crate) fn as_i64(value: Option<&Value>) -> Option<i64> {
    value.and_then(Value::as_i64)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use super::*;
    use crate::telemetry::NoopTelemetry;

    pub fn upstreams(config: UpstreamsConfig) -> Upstreams {
        Upstreams::new(
            HttpClient::new(),
            Arc::new(Estimator::new()),
            Arc::new(NoopTelemetry),
            config,
        )
    }

    pub fn setting(provider: &str, pairs: &[(&str, &str)]) -> Arc<ProviderSetting> {
        Arc::new(ProviderSetting {
            id: format!("{provider}-setting"),
            provider: provider.to_string(),
            setting: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        })
    }

    pub fn call(provider: &str, setting: Arc<ProviderSetting>, path: &str, body: Value) -> Call {
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Call {
            scope: Arc::new(RequestScope::new(
                "req",
                "POST",
                path,
                "",
                Duration::from_secs(5),
            )),
            provider: provider.to_string(),
            setting,
            method: Method::POST,
            path: path.to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
            json: Some(body),
            multipart: None,
            model,
            stream,
            prompt_tokens: 0,
            route_config: None,
            auth_param: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_headers_drops_credentials_and_hop_by_hop() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer gateway-key"));
        h.insert("x-custom-event-id", HeaderValue::from_static("corr"));
        h.insert("content-type", HeaderValue::from_static("application/json"));
        h.insert("user-agent", HeaderValue::from_static("sdk/1.0"));
        h.insert("openai-organization", HeaderValue::from_static("org"));

        let out = forward_headers(&h, false, false);
        assert!(out.get("authorization").is_none());
        assert!(out.get("x-custom-event-id").is_none());
        assert_eq!(out["content-type"], "application/json");
        assert_eq!(out["user-agent"], "sdk/1.0");
        assert_eq!(out["openai-organization"], "org");

        let out = forward_headers(&h, true, true);
        assert!(out.get("user-agent").is_none());
        assert!(out.get("content-type").is_none());
    }

    #[test]
    fn test_relay_headers_drops_length() {
        let mut h = HeaderMap::new();
        h.insert("content-length", HeaderValue::from_static("10"));
        h.insert("x-request-id", HeaderValue::from_static("up-1"));
        let out = relay_headers(&h);
        assert!(out.get("content-length").is_none());
        assert_eq!(out["x-request-id"], "up-1");
    }
}
