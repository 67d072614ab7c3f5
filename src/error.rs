use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::limits::validator::ValidationFailure;
use crate::policy::PolicyError;
use crate::store::StoreError;

/// Why a key stopped being usable for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Ttl,
    CostLimit,
}

impl ExpiryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ttl => "ttl",
            Self::CostLimit => "cost-limit",
        }
    }
}

/// Unified proxy error type. Bodies follow the OpenAI error envelope so SDKs
/// pointed at the gateway keep working.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("{}", expiry_detail(.reason))]
    Expired { reason: ExpiryReason },

    #[error("request blocked by policy: {0}")]
    Blocked(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

fn expiry_detail(reason: &ExpiryReason) -> &'static str {
    match reason {
        ExpiryReason::Ttl => "key has expired",
        ExpiryReason::CostLimit => "key exceeded its lifetime cost limit",
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
    detail: String,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    code: Option<String>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Auth(_) | Self::Expired { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::Blocked(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Validation(_) | Self::Auth(_) | Self::Expired { .. } => "authentication_error",
            Self::Forbidden(_) | Self::Blocked(_) => "permission_error",
            Self::NotFound(_) => "not_found_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::RateLimited(_) => "rate_limit_error",
            Self::Upstream(_) | Self::Timeout => "api_error",
            Self::Internal(_) => "server_error",
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::Auth(_) | Self::Validation(_) => Some("invalid_api_key"),
            Self::Expired { reason } => Some(match reason {
                ExpiryReason::Ttl => "key_expired",
                ExpiryReason::CostLimit => "cost_limit_exceeded",
            }),
            Self::RateLimited(_) => Some("rate_limit_exceeded"),
            Self::Blocked(_) => Some("policy_blocked"),
            Self::Timeout => Some("upstream_timeout"),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorResponse {
            error: ErrorDetail {
                message: message.clone(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(String::from),
            },
            detail: message,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Validation(msg) => Self::BadRequest(msg),
            other => {
                tracing::error!(error = %other, "Store error");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<ValidationFailure> for AppError {
    fn from(err: ValidationFailure) -> Self {
        match err {
            ValidationFailure::Invalid(msg) => Self::Validation(msg),
            ValidationFailure::Expired(reason) => Self::Expired { reason },
            ValidationFailure::RateLimited { .. } | ValidationFailure::CostRateLimited { .. } => {
                Self::RateLimited(err.to_string())
            }
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!(error = %err, "HTTP client error");
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {err}"))
    }
}

impl From<PolicyError> for AppError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Blocked(what) => Self::Blocked(what),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_expired_ttl_body() {
        let (status, body) = body_json(AppError::Expired {
            reason: ExpiryReason::Ttl,
        })
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["detail"], "key has expired");
        assert_eq!(body["error"]["message"], "key has expired");
        assert_eq!(body["error"]["code"], "key_expired");
    }

    #[tokio::test]
    async fn test_rate_limited_is_429() {
        let (status, body) = body_json(AppError::RateLimited("2 per m".into())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Auth("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Validation("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::Blocked("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            AppError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_store_not_found_maps_to_404() {
        let err: AppError = StoreError::NotFound("route".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
