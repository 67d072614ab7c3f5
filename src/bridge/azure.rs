//! Azure OpenAI. Paths are deployment-scoped:
//! `/openai/deployments/{deployment}/chat/completions?api-version=...`.

use axum::http::HeaderMap;
use serde_json::Value;

use super::openai::{ChunkAccountant, ModelSource, unary_usage};
use super::{Call, HttpBridge, Pricer, StreamAccountant, Upstreams, header_value};
use crate::error::AppError;
use crate::proxy::scope::Usage;

pub struct Azure;

/// Deployment name from an Azure path, if it has one.
pub fn deployment(path: &str) -> Option<&str> {
    let rest = path.trim_start_matches('/').strip_prefix("openai/deployments/")?;
    rest.split('/').next().filter(|d| !d.is_empty())
}

impl HttpBridge for Azure {
    fn url(&self, up: &Upstreams, call: &Call) -> Result<String, AppError> {
        let resource = call
            .setting
            .get("resourceName")
            .ok_or_else(|| AppError::Internal("azure setting has no resourceName".into()))?;
        let base = up.config.azure.replace("{resource}", resource);
        let mut url = format!("{}{}", base.trim_end_matches('/'), call.path_and_query());
        let has_version = call
            .query
            .as_deref()
            .is_some_and(|q| q.split('&').any(|p| p.starts_with("api-version=")));
        if !has_version {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str("api-version=");
            url.push_str(&up.config.azure_api_version);
        }
        Ok(url)
    }

    fn authorize(&self, _: &Upstreams, call: &Call, headers: &mut HeaderMap) -> Result<(), AppError> {
        headers.insert("api-key", header_value(call.api_key()?)?);
        Ok(())
    }

    fn unary_usage(&self, pricer: &Pricer, call: &Call, body: &Value) -> Usage {
        unary_usage(pricer, call, body, ModelSource::Response)
    }

    fn accountant(&self, pricer: Pricer, call: &Call) -> Box<dyn StreamAccountant> {
        Box::new(ChunkAccountant::new(pricer, call, ModelSource::Response))
    }
}
