//! OpenAI-compatible hosts: self-hosted vLLM and DeepInfra.

use axum::http::HeaderMap;
use serde_json::Value;

use super::openai::{ChunkAccountant, ModelSource, bearer, unary_usage};
use super::{Call, HttpBridge, Pricer, StreamAccountant, Upstreams};
use crate::error::AppError;
use crate::proxy::scope::Usage;

/// vLLM server at the setting's `vllmUrl`. The API key is optional.
pub struct Vllm;

impl HttpBridge for Vllm {
    fn url(&self, _: &Upstreams, call: &Call) -> Result<String, AppError> {
        let base = call
            .setting
            .get("vllmUrl")
            .ok_or_else(|| AppError::Internal("vllm setting has no vllmUrl".into()))?;
        Ok(format!("{}{}", base.trim_end_matches('/'), call.path_and_query()))
    }

    fn authorize(&self, _: &Upstreams, call: &Call, headers: &mut HeaderMap) -> Result<(), AppError> {
        match call.setting.api_key() {
            Some(key) => bearer(headers, key),
            None => Ok(()),
        }
    }

    fn unary_usage(&self, pricer: &Pricer, call: &Call, body: &Value) -> Usage {
        unary_usage(pricer, call, body, ModelSource::Request)
    }

    fn accountant(&self, pricer: Pricer, call: &Call) -> Box<dyn StreamAccountant> {
        Box::new(ChunkAccountant::new(pricer, call, ModelSource::Request))
    }
}

/// DeepInfra's OpenAI endpoint. Its base URL already ends in `/v1/openai`,
/// so a client-side `/v1` prefix is dropped.
pub struct DeepInfra;

impl HttpBridge for DeepInfra {
    fn url(&self, up: &Upstreams, call: &Call) -> Result<String, AppError> {
        let rest = call.path_and_query();
        let rest = rest.strip_prefix("/v1").unwrap_or(&rest);
        Ok(format!("{}{}", up.config.deepinfra.trim_end_matches('/'), rest))
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
