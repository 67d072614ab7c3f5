use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::error::AppError;

/// Paths whose native SDK authenticates with `x-api-key`.
fn accepts_x_api_key(path: &str) -> bool {
    path.starts_with("/api/providers/anthropic/") || path.starts_with("/api/providers/bedrock/")
}

/// Caller's gateway key from `Authorization: Bearer`, or from `x-api-key`
/// on Anthropic-shaped paths.
pub fn extract_bearer_token(headers: &HeaderMap, path: &str) -> Result<String, AppError> {
    if let Some(header) = headers.get(AUTHORIZATION) {
        let value = header
            .to_str()
            .map_err(|_| AppError::Auth("Invalid Authorization header encoding".to_string()))?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or_else(|| {
                AppError::Auth("Authorization header must use Bearer scheme".to_string())
            })?
            .trim();
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }

    if accepts_x_api_key(path) {
        if let Some(token) = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            return Ok(token.to_string());
        }
    }

    Err(AppError::Auth("api key not found in header".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn test_bearer() {
        let h = headers(&[("authorization", "Bearer sk-1")]);
        assert_eq!(
            extract_bearer_token(&h, "/api/providers/openai/v1/chat/completions").unwrap(),
            "sk-1"
        );
    }

    #[test]
    fn test_x_api_key_only_for_anthropic_paths() {
        let h = headers(&[("x-api-key", "sk-2")]);
        assert_eq!(
            extract_bearer_token(&h, "/api/providers/anthropic/v1/complete").unwrap(),
            "sk-2"
        );
        assert!(extract_bearer_token(&h, "/api/providers/openai/v1/completions").is_err());
    }

    #[test]
    fn test_missing_and_empty() {
        assert!(extract_bearer_token(&HeaderMap::new(), "/x").is_err());
        let h = headers(&[("authorization", "Bearer   ")]);
        assert!(extract_bearer_token(&h, "/x").is_err());
        let h = headers(&[("authorization", "Basic abc")]);
        assert!(extract_bearer_token(&h, "/x").is_err());
    }
}
