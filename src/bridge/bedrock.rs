//! Claude on AWS Bedrock, through the Bedrock runtime SDK.
//!
//! Client paths are `/anthropic/v1/complete` and `/anthropic/v1/messages`;
//! the model id travels in the body and is moved into the SDK call. Stream
//! chunks are re-framed as SSE so clients see the same events the
//! Anthropic API sends.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_bedrockruntime::Client;
use aws_sdk_bedrockruntime::config::Credentials;
use aws_sdk_bedrockruntime::config::http::HttpResponse;
use aws_sdk_bedrockruntime::error::{DisplayErrorContext, SdkError};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::{Instant, timeout_at};

use super::anthropic::{self, EventAccountant};
use super::{AccountingStream, Call, Upstreams, log_response_body};
use crate::auth::sha256_key;
use crate::error::AppError;
use crate::net::SseEvent;
use crate::proxy::emitter::StreamingResponse;
use crate::store::ProviderSetting;

/// Bedrock requires this in place of the `anthropic-version` header.
const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// SDK clients, one per setting and credential set. Rotating a setting's
/// credentials builds a new client.
pub struct BedrockClients {
    endpoint: Option<String>,
    clients: DashMap<String, Client>,
}

impl BedrockClients {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            clients: DashMap::new(),
        }
    }

    async fn client(&self, setting: &ProviderSetting) -> Result<Client, AppError> {
        let field = |name: &str| {
            setting
                .get(name)
                .ok_or_else(|| AppError::Internal(format!("bedrock setting has no {name}")))
        };
        let access_key = field("awsAccessKeyId")?;
        let secret_key = field("awsSecretAccessKey")?;
        let region = field("awsRegion")?;

        let cache_key = format!(
            "{}:{}",
            setting.id,
            sha256_key(&format!("{access_key}:{secret_key}:{region}"))
        );
        if let Some(client) = self.clients.get(&cache_key) {
            return Ok(client.clone());
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "tollgate",
            ));
        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let client = Client::new(&loader.load().await);
        tracing::debug!(setting_id = %setting.id, region, "Built Bedrock client");
        self.clients.insert(cache_key, client.clone());
        Ok(client)
    }
}

/// The body Bedrock expects: no `model` or `stream`, and an explicit
/// `anthropic_version` for the messages API.
fn invoke_body(call: &Call) -> Result<Vec<u8>, AppError> {
    let mut body = call.json.clone().unwrap_or_else(|| Value::Object(Default::default()));
    let obj = body
        .as_object_mut()
        .ok_or_else(|| AppError::BadRequest("request body must be a JSON object".into()))?;
    obj.remove("model");
    obj.remove("stream");
    if call.path.trim_end_matches('/').ends_with("/messages") {
        obj.entry("anthropic_version")
            .or_insert_with(|| Value::String(BEDROCK_ANTHROPIC_VERSION.into()));
    }
    Ok(serde_json::to_vec(&body)?)
}

/// An SSE frame for one Bedrock chunk, named after its `type` field.
fn chunk_event(bytes: &[u8]) -> Bytes {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => {
            let name = value["type"].as_str().unwrap_or("completion").to_string();
            SseEvent::named(name, value.to_string()).to_bytes()
        }
        Err(_) => SseEvent::data(String::from_utf8_lossy(bytes)).to_bytes(),
    }
}

fn sdk_error_response<E>(err: SdkError<E, HttpResponse>) -> Result<Response, AppError>
where
    E: std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
            tracing::warn!(status = code, error = %message, "Bedrock returned an error");
            let body = serde_json::json!({ "message": message });
            let mut response = Response::new(Body::from(body.to_string()));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(response)
        }
        None if matches!(err, SdkError::TimeoutError(_)) => Err(AppError::Timeout),
        None => Err(AppError::Upstream(message)),
    }
}

pub async fn forward(up: &Upstreams, call: Call) -> Result<Response, AppError> {
    if call.model.is_empty() {
        return Err(AppError::BadRequest("bedrock requests need a model".into()));
    }
    let client = up.bedrock.client(&call.setting).await?;
    let payload = invoke_body(&call)?;
    let deadline = Instant::now() + call.scope.timeout();

    tracing::debug!(model = %call.model, stream = call.stream, "Forwarding to Bedrock");

    if call.stream {
        let sent = timeout_at(
            deadline,
            client
                .invoke_model_with_response_stream()
                .model_id(&call.model)
                .content_type("application/json")
                .accept("application/json")
                .body(Blob::new(payload))
                .send(),
        )
        .await
        .map_err(|_| AppError::Timeout)?;
        let out = match sent {
            Ok(out) => out,
            Err(err) => return sdk_error_response(err),
        };

        let chunks = futures::stream::unfold(out.body, |mut rx| async move {
            match rx.recv().await {
                Ok(Some(ResponseStream::Chunk(part))) => {
                    let bytes = part.bytes().map(|b| chunk_event(b.as_ref())).unwrap_or_default();
                    Some((Ok(bytes), rx))
                }
                Ok(Some(_)) => Some((Ok(Bytes::new()), rx)),
                Ok(None) => None,
                Err(e) => Some((Err(DisplayErrorContext(&e).to_string()), rx)),
            }
        });

        let accountant = Box::new(EventAccountant::new(up.pricer(&call), &call));
        let stream = AccountingStream::new(chunks, accountant, call.scope.clone(), deadline);
        let mut response = Response::new(Body::from_stream(stream));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        response.extensions_mut().insert(StreamingResponse);
        return Ok(response);
    }

    let sent = timeout_at(
        deadline,
        client
            .invoke_model()
            .model_id(&call.model)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(payload))
            .send(),
    )
    .await
    .map_err(|_| AppError::Timeout)?;
    let out = match sent {
        Ok(out) => out,
        Err(err) => return sdk_error_response(err),
    };

    let body = out.body.into_inner();
    match serde_json::from_slice::<Value>(&body) {
        Ok(value) => {
            let usage = anthropic::unary_usage(&up.pricer(&call), &call, &value);
            call.scope.record_usage(usage);
        }
        Err(e) => tracing::debug!(error = %e, "Bedrock body is not JSON"),
    }
    log_response_body(up, &call, &body);

    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}
