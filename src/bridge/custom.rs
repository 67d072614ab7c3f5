//! User-defined providers. Each route config says where the model, prompt
//! and completion live in the JSON bodies and how a stream ends.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::Value;

use super::{Call, Flow, HttpBridge, Pricer, StreamAccountant, Upstreams, header_value};
use crate::error::AppError;
use crate::net::SseEvent;
use crate::proxy::jsonpath;
use crate::proxy::scope::Usage;
use crate::store::RouteConfig;

pub struct Custom;

fn route_config(call: &Call) -> Result<&Arc<RouteConfig>, AppError> {
    call.route_config.as_ref().ok_or_else(|| {
        AppError::NotFound(format!("no route config for {} {}", call.provider, call.path))
    })
}

impl HttpBridge for Custom {
    fn url(&self, _: &Upstreams, call: &Call) -> Result<String, AppError> {
        let target = &route_config(call)?.target_url;
        Ok(match call.query.as_deref() {
            Some(q) if !q.is_empty() => {
                let sep = if target.contains('?') { '&' } else { '?' };
                format!("{target}{sep}{q}")
            }
            _ => target.clone(),
        })
    }

    fn authorize(&self, _: &Upstreams, call: &Call, headers: &mut HeaderMap) -> Result<(), AppError> {
        if call.auth_param.is_empty() {
            return Ok(());
        }
        if let Some(key) = call.setting.api_key() {
            let name = axum::http::HeaderName::from_bytes(call.auth_param.as_bytes()).map_err(|_| {
                AppError::Internal(format!("invalid authentication_param {:?}", call.auth_param))
            })?;
            headers.insert(name, header_value(key)?);
        }
        Ok(())
    }

    fn unary_usage(&self, pricer: &Pricer, call: &Call, body: &Value) -> Usage {
        let completion = route_config(call)
            .ok()
            .and_then(|rc| jsonpath::lookup_text(body, &rc.response_completion_location))
            .unwrap_or_default();
        pricer.usage(
            &call.model,
            call.prompt_tokens,
            pricer.count_anthropic(&completion),
        )
    }

    fn accountant(&self, pricer: Pricer, call: &Call) -> Box<dyn StreamAccountant> {
        let (end_word, location) = route_config(call)
            .map(|rc| {
                (
                    rc.stream_end_word.clone(),
                    rc.stream_response_completion_location.clone(),
                )
            })
            .unwrap_or_default();
        Box::new(CustomAccountant {
            pricer,
            model: call.model.clone(),
            prompt_tokens: call.prompt_tokens,
            completion_tokens: 0,
            end_word,
            location,
        })
    }

    /// Custom upstreams are trusted to stream when asked, whatever their
    /// content type says.
    fn streams(&self, call: &Call, _: &str) -> bool {
        call.stream
    }
}

struct CustomAccountant {
    pricer: Pricer,
    model: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    end_word: String,
    location: String,
}

impl StreamAccountant for CustomAccountant {
    fn observe(&mut self, event: &SseEvent) -> Flow {
        if !self.end_word.is_empty() && event.data.trim() == self.end_word {
            return Flow::Stop;
        }
        if let Ok(data) = serde_json::from_str::<Value>(&event.data) {
            if let Some(text) = jsonpath::lookup_text(&data, &self.location) {
                self.completion_tokens += self.pricer.count_anthropic(&text);
            }
        }
        Flow::Continue
    }

    fn finish(&mut self) -> Usage {
        self.pricer
            .usage(&self.model, self.prompt_tokens, self.completion_tokens)
    }
}
