//! Per-request state shared by the middleware, the handler and the
//! response body.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::store::{ApiKey, ProviderSetting};

/// What the request has learned about itself so far. The event emitter
/// reads the final copy.
#[derive(Debug, Clone, Default)]
pub struct ScopeState {
    pub key: Option<Arc<ApiKey>>,
    pub setting: Option<Arc<ProviderSetting>>,
    pub provider: String,
    pub model: String,
    pub stream: bool,
    /// Prompt text for providers whose completion count needs it later.
    pub prompt: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Pre-dispatch estimate used by the validator.
    pub prompt_cost: f64,
    pub cost_in_usd: f64,
}

/// Final usage a bridge reports for the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_in_usd: f64,
}

pub struct RequestScope {
    pub request_id: String,
    pub method: String,
    pub path: String,
    /// Caller correlation id from `x-custom-event-id`.
    pub custom_id: String,
    status: AtomicU16,
    timeout: Mutex<Duration>,
    state: Mutex<ScopeState>,
}

impl RequestScope {
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        custom_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            custom_id: custom_id.into(),
            // Anything that never reaches a response counts as a server error.
            status: AtomicU16::new(500),
            timeout: Mutex::new(timeout),
            state: Mutex::new(ScopeState::default()),
        }
    }

    pub fn status(&self) -> u16 {
        self.status.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::Release);
    }

    /// Upstream deadline for this request.
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut ScopeState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn snapshot(&self) -> ScopeState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn key(&self) -> Option<Arc<ApiKey>> {
        self.update(|s| s.key.clone())
    }

    pub fn setting(&self) -> Option<Arc<ProviderSetting>> {
        self.update(|s| s.setting.clone())
    }

    pub fn record_usage(&self, usage: Usage) {
        self.update(|s| {
            if !usage.model.is_empty() {
                s.model = usage.model;
            }
            s.prompt_tokens = usage.prompt_tokens;
            s.completion_tokens = usage.completion_tokens;
            s.cost_in_usd = usage.cost_in_usd;
        });
    }

    /// Provider and model that actually served the request.
    pub fn set_served_by(&self, provider: &str, model: &str) {
        self.update(|s| {
            s.provider = provider.to_string();
            s.model = model.to_string();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_500() {
        let scope = RequestScope::new("r", "POST", "/x", "", Duration::from_secs(1));
        assert_eq!(scope.status(), 500);
        scope.set_status(200);
        assert_eq!(scope.status(), 200);
    }

    #[test]
    fn test_record_usage_keeps_model_when_empty() {
        let scope = RequestScope::new("r", "POST", "/x", "", Duration::from_secs(1));
        scope.set_served_by("openai", "gpt-4");
        scope.record_usage(Usage {
            prompt_tokens: 3,
            completion_tokens: 4,
            cost_in_usd: 0.1,
            ..Default::default()
        });
        let s = scope.snapshot();
        assert_eq!(s.model, "gpt-4");
        assert_eq!((s.prompt_tokens, s.completion_tokens), (3, 4));
    }
}
