use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use uuid::Uuid;

use super::emitter::{EventGuard, StreamingResponse, guard_body};
use super::inspect::{self, InspectRequest, Inspection, Inspector, Target};
use super::multipart::{self, MultipartPart};
use super::scope::RequestScope;
use crate::AppState;
use crate::auth::extract_bearer_token;
use crate::config::PrivacyMode;
use crate::error::AppError;
use crate::limits::validator::ValidationFailure;
use crate::policy::WARNING_HEADER;
use crate::routes;
use crate::store::{ApiKey, CustomProvider, Policy, ProviderSetting, Route, RouteConfig};

pub const CUSTOM_EVENT_ID_HEADER: &str = "x-custom-event-id";
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Reason written to the store when a key is revoked on expiry.
pub const REVOKE_REASON: &str = "Key has expired or exceeded set spend limit";

/// What admission established about a request, for the handler.
#[derive(Clone)]
pub struct Admitted {
    pub target: Target,
    pub setting: Arc<ProviderSetting>,
    /// Body after policy redaction.
    pub body: Bytes,
    pub json: Option<Value>,
    pub multipart: Option<Vec<MultipartPart>>,
    pub inspection: Inspection,
    pub custom_provider: Option<Arc<CustomProvider>>,
    pub route_config: Option<Arc<RouteConfig>>,
    pub route: Option<Arc<Route>>,
}

/// Governance layer for every proxied route.
///
/// Authenticates the gateway key, inspects and prices the body, applies
/// policies and allow-lists, validates limits and counts the request.
/// Exactly one event is emitted per request whatever happens, after the
/// response body has finished for streams.
///
/// The timeout stage only fixes the request's deadline in its scope (the
/// configured default, or `x-request-timeout`). The bridge enforces it over
/// the upstream call and the whole relayed body, so a timed out request
/// still ends in a 504 with its event.
pub async fn governance(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let custom_id = request
        .headers()
        .get(CUSTOM_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let scope = Arc::new(RequestScope::new(
        Uuid::new_v4().to_string(),
        request.method().as_str(),
        request.uri().path(),
        custom_id,
        state.config.proxy.default_timeout,
    ));
    let guard = EventGuard::new(scope.clone(), state.emit_sink());

    let response = match admit(&state, &scope, request).await {
        Ok((request, warning)) => {
            let mut response = next.run(request).await;
            if let Some(value) = warning.and_then(|w| HeaderValue::from_str(&w).ok()) {
                response.headers_mut().insert(WARNING_HEADER, value);
            }
            response
        }
        Err(err) => {
            let reason = denial_reason(&err);
            tracing::info!(request_id = %scope.request_id, path = %scope.path, reason, error = %err, "Request denied");
            state.telemetry.incr("proxy.denied", &[("reason", reason)], 1.0);
            err.into_response()
        }
    };

    scope.set_status(response.status().as_u16());
    if response.extensions().get::<StreamingResponse>().is_some() {
        let (parts, body) = response.into_parts();
        Response::from_parts(parts, guard_body(body, guard))
    } else {
        drop(guard);
        response
    }
}

fn denial_reason(err: &AppError) -> &'static str {
    match err {
        AppError::Auth(_) | AppError::Validation(_) => "auth",
        AppError::Expired { .. } => "expired",
        AppError::Forbidden(_) => "forbidden",
        AppError::Blocked(_) => "policy",
        AppError::RateLimited(_) => "rate_limit",
        AppError::NotFound(_) => "not_found",
        AppError::BadRequest(_) => "bad_request",
        AppError::Timeout | AppError::Upstream(_) | AppError::Internal(_) => "internal",
    }
}

async fn admit(
    state: &AppState,
    scope: &Arc<RequestScope>,
    request: Request,
) -> Result<(Request, Option<String>), AppError> {
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();
    let target = inspect::classify(&path);
    if target == Target::Unknown {
        return Err(AppError::NotFound(format!("no proxy route for {path}")));
    }

    // 1. Key
    let token = extract_bearer_token(request.headers(), &path)?;
    let hash = state.encryptor.encrypt(&token).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to hash api key");
        AppError::Internal("failed to hash api key".into())
    })?;
    let key = state
        .mirror
        .key(&hash)
        .ok_or_else(|| AppError::Auth("api key not found".into()))?;
    if key.revoked {
        return Err(AppError::Auth("api key has been revoked".into()));
    }
    scope.update(|s| s.key = Some(key.clone()));

    // 2. Setting, and what the path points at
    let setting = select_setting(state, &key, &target)?;
    let (custom_provider, route_config, route) = match &target {
        Target::Custom { name, rest } => {
            let cp = state
                .mirror
                .custom_provider(name)
                .ok_or_else(|| AppError::NotFound(format!("custom provider {name} not found")))?;
            let rc = state.mirror.route_config(name, rest).ok_or_else(|| {
                AppError::NotFound(format!("route config {rest} not found for {name}"))
            })?;
            (Some(cp), Some(rc), None)
        }
        Target::Route { path } => {
            let route = state
                .mirror
                .route(path)
                .ok_or_else(|| AppError::NotFound(format!("route {path} not found")))?;
            if !route.key_ids.is_empty() && !route.key_ids.contains(&key.key_id) {
                return Err(AppError::Forbidden("key is not allowed to use this route".into()));
            }
            (None, None, Some(route))
        }
        _ => (None, None, None),
    };

    // 3. Body
    let (mut parts, body) = request.into_parts();
    let bytes = to_bytes(body, state.config.proxy.max_body_bytes)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;
    let (mut json, form) = parse_body(&parts.headers, &bytes)?;

    // 4. Policies
    let policies: Vec<Arc<Policy>> = key
        .policy_ids
        .iter()
        .filter_map(|id| state.mirror.policy(id))
        .collect();
    let mut body = bytes;
    let mut warning = None;
    if let Some(value) = json.as_mut() {
        let report = state.policies.evaluate(&policies, value)?;
        if report.redacted {
            body = Bytes::from(serde_json::to_vec(value)?);
        }
        if !report.warnings.is_empty() {
            warning = Some(report.warnings.join(", "));
        }
    }
    if state.config.privacy.mode != PrivacyMode::Strict && key.should_log_request {
        tracing::debug!(request_id = %scope.request_id, body = %String::from_utf8_lossy(&body), "Request body");
    }

    // 5. Inspection
    let inspection = inspect_target(
        state,
        &target,
        &setting,
        json.as_ref(),
        form.as_deref(),
        route_config.as_deref(),
        route.as_deref(),
    );
    scope.update(|s| {
        s.setting = Some(setting.clone());
        s.provider = target.provider().unwrap_or_default().to_string();
        s.model = inspection.model.clone();
        s.stream = inspection.stream;
        s.prompt = inspection.prompt.clone();
        s.prompt_tokens = inspection.prompt_tokens;
        s.prompt_cost = inspection.prompt_cost;
    });

    // 6. Allow-lists
    if !key.allowed_paths.is_empty()
        && !key
            .allowed_paths
            .iter()
            .any(|p| p.method.eq_ignore_ascii_case(&method) && p.path == path)
    {
        return Err(AppError::Forbidden(format!("{method} {path} is not allowed for this key")));
    }
    if route.is_none()
        && !setting.allowed_models.is_empty()
        && !inspection.model.is_empty()
        && !setting.allowed_models.contains(&inspection.model)
    {
        return Err(AppError::Forbidden(format!(
            "model {} is not allowed for this key",
            inspection.model
        )));
    }

    // 7. Limits
    match state.validator.validate(Some(key.as_ref()), inspection.prompt_cost).await {
        Ok(()) => {}
        Err(ValidationFailure::Expired(reason)) => {
            revoke(state, &key).await;
            return Err(AppError::Expired { reason });
        }
        Err(e) => return Err(e.into()),
    }

    // 8. Deadline, enforced by the bridge
    if let Some(timeout) = request_timeout(&parts.headers)? {
        scope.set_timeout(timeout);
    }

    parts.extensions.insert(scope.clone());
    parts.extensions.insert(Admitted {
        target,
        setting,
        body: body.clone(),
        json,
        multipart: form,
        inspection,
        custom_provider,
        route_config,
        route,
    });
    Ok((Request::from_parts(parts, Body::from(body)), warning))
}

/// The setting a key uses for this target: the primary one when its
/// provider matches, otherwise the first auxiliary setting that does.
fn select_setting(
    state: &AppState,
    key: &ApiKey,
    target: &Target,
) -> Result<Arc<ProviderSetting>, AppError> {
    let primary = key
        .all_setting_ids()
        .next()
        .and_then(|id| state.mirror.setting(id))
        .ok_or_else(|| AppError::Auth("provider setting not found".into()))?;

    let Some(provider) = target.provider() else {
        return Ok(primary);
    };
    if primary.provider == provider {
        return Ok(primary);
    }
    key.all_setting_ids()
        .skip(1)
        .filter_map(|id| state.mirror.setting(id))
        .find(|s| s.provider == provider)
        .ok_or_else(|| {
            AppError::Forbidden(format!("key is not allowed to call provider {provider}"))
        })
}

type ParsedBody = (Option<Value>, Option<Vec<MultipartPart>>);

fn parse_body(headers: &HeaderMap, bytes: &Bytes) -> Result<ParsedBody, AppError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if multipart::is_multipart(content_type) {
        let parts = multipart::parse_multipart_form(content_type, bytes)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        return Ok((None, Some(parts)));
    }
    if bytes.is_empty() {
        return Ok((None, None));
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Ok((Some(value), None)),
        Err(e) if content_type.contains("json") => Err(e.into()),
        Err(_) => Ok((None, None)),
    }
}

fn inspect_target(
    state: &AppState,
    target: &Target,
    setting: &ProviderSetting,
    json: Option<&Value>,
    form: Option<&[MultipartPart]>,
    route_config: Option<&RouteConfig>,
    route: Option<&Route>,
) -> Inspection {
    let inspector = Inspector {
        estimator: &state.estimator,
        telemetry: state.telemetry.as_ref(),
    };
    match (target, route) {
        (Target::Provider { provider, rest }, _) | (Target::Custom { name: provider, rest }, _) => {
            inspector.inspect(&InspectRequest {
                provider,
                rest,
                json,
                multipart: form,
                route_config,
                overrides: setting.cost_map.as_ref(),
            })
        }
        // A route is priced as its first step would be.
        (Target::Route { .. }, Some(route)) => {
            let Some(step) = route.steps.first() else {
                return Inspection::default();
            };
            let mut probe = json.cloned().unwrap_or_else(|| Value::Object(Default::default()));
            if let Some(obj) = probe.as_object_mut() {
                obj.insert("model".into(), Value::String(step.model.clone()));
            }
            let rest = routes::step_path(&step.provider, &route.request_format, &step.model);
            let mut out = inspector.inspect(&InspectRequest {
                provider: &step.provider,
                rest: &rest,
                json: Some(&probe),
                multipart: None,
                route_config: None,
                overrides: None,
            });
            out.stream = json.and_then(|j| j["stream"].as_bool()).unwrap_or(false);
            out
        }
        _ => Inspection::default(),
    }
}

fn request_timeout(headers: &HeaderMap) -> Result<Option<Duration>, AppError> {
    let Some(raw) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| AppError::BadRequest(format!("invalid {REQUEST_TIMEOUT_HEADER} header")))?;
    humantime::parse_duration(raw.trim())
        .map(Some)
        .map_err(|e| AppError::BadRequest(format!("invalid {REQUEST_TIMEOUT_HEADER}: {e}")))
}

/// Mark the key revoked in the store. The mirror catches up on its next
/// poll.
async fn revoke(state: &AppState, key: &ApiKey) {
    let store = state.store.clone();
    let key_id = key.key_id.clone();
    let result = tokio::task::spawn_blocking(move || store.revoke_key(&key_id, REVOKE_REASON)).await;
    match result {
        Ok(Ok(())) => tracing::info!(key_id = %key.key_id, "Revoked expired key"),
        Ok(Err(e)) => tracing::error!(key_id = %key.key_id, error = %e, "Failed to revoke key"),
        Err(e) => tracing::error!(key_id = %key.key_id, error = %e, "Revoke task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_header() {
        let mut h = HeaderMap::new();
        assert_eq!(request_timeout(&h).unwrap(), None);
        h.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static("30s"));
        assert_eq!(request_timeout(&h).unwrap(), Some(Duration::from_secs(30)));
        h.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        assert!(matches!(request_timeout(&h), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_parse_body() {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let (json, form) = parse_body(&h, &Bytes::from_static(br#"{"a":1}"#)).unwrap();
        assert_eq!(json.unwrap()["a"], 1);
        assert!(form.is_none());

        assert!(parse_body(&h, &Bytes::from_static(b"{not json")).is_err());
        assert_eq!(parse_body(&h, &Bytes::new()).unwrap(), (None, None));

        h.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert_eq!(parse_body(&h, &Bytes::from_static(b"hello")).unwrap(), (None, None));
    }

    #[test]
    fn test_denial_reasons() {
        assert_eq!(denial_reason(&AppError::RateLimited("x".into())), "rate_limit");
        assert_eq!(denial_reason(&AppError::Blocked("x".into())), "policy");
        assert_eq!(denial_reason(&AppError::Auth("x".into())), "auth");
    }
}
