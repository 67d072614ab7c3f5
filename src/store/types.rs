//! Entities owned by the durable store and mirrored in memory.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::limits::TimeUnit;

/// Provider names with a built-in bridge. Custom providers may not reuse them.
pub const RESERVED_PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "azure",
    "deepinfra",
    "vllm",
    "bedrock",
];

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

/// A `(method, path)` pair a key is allowed to call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAccess {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_id: String,
    pub name: String,
    /// One-way hash of the secret produced by the encryption sidecar.
    pub key: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub revoked_reason: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ttl: String,
    #[serde(default)]
    pub cost_limit_in_usd: f64,
    #[serde(default)]
    pub cost_limit_in_usd_over_time: f64,
    #[serde(default)]
    pub cost_limit_in_usd_unit: String,
    #[serde(default)]
    pub rate_limit_over_time: i64,
    #[serde(default)]
    pub rate_limit_unit: String,
    #[serde(default)]
    pub setting_id: String,
    #[serde(default)]
    pub setting_ids: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<PathAccess>,
    #[serde(default)]
    pub should_log_request: bool,
    #[serde(default)]
    pub should_log_response: bool,
    #[serde(default)]
    pub rotation_enabled: bool,
    #[serde(default)]
    pub policy_ids: Vec<String>,
}

impl ApiKey {
    /// Parsed TTL, if one is set and valid.
    pub fn ttl_duration(&self) -> Option<Duration> {
        if self.ttl.is_empty() {
            return None;
        }
        humantime::parse_duration(&self.ttl).ok()
    }

    pub fn rate_unit(&self) -> Option<TimeUnit> {
        self.rate_limit_unit.parse().ok()
    }

    pub fn cost_unit(&self) -> Option<TimeUnit> {
        self.cost_limit_in_usd_unit.parse().ok()
    }

    /// Every setting id the key may use, primary first.
    pub fn all_setting_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.setting_id.as_str())
            .filter(|id| !id.is_empty())
            .chain(self.setting_ids.iter().map(String::as_str))
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::Validation("key name is empty".into()));
        }
        if self.key.is_empty() {
            return Err(StoreError::Validation("key hash is empty".into()));
        }
        if (self.rate_limit_over_time == 0) != self.rate_limit_unit.is_empty() {
            return Err(StoreError::Validation(
                "rate_limit_unit must be set exactly when rate_limit_over_time is non-zero".into(),
            ));
        }
        if self.rate_limit_over_time < 0 {
            return Err(StoreError::Validation("rate_limit_over_time is negative".into()));
        }
        if !self.rate_limit_unit.is_empty() {
            match self.rate_unit() {
                Some(TimeUnit::Month) | None => {
                    return Err(StoreError::Validation(format!(
                        "invalid rate_limit_unit: {}",
                        self.rate_limit_unit
                    )));
                }
                Some(_) => {}
            }
        }
        if (self.cost_limit_in_usd_over_time == 0.0) != self.cost_limit_in_usd_unit.is_empty() {
            return Err(StoreError::Validation(
                "cost_limit_in_usd_unit must be set exactly when cost_limit_in_usd_over_time is non-zero"
                    .into(),
            ));
        }
        if !self.cost_limit_in_usd_unit.is_empty() {
            match self.cost_unit() {
                Some(TimeUnit::Second) | None => {
                    return Err(StoreError::Validation(format!(
                        "invalid cost_limit_in_usd_unit: {}",
                        self.cost_limit_in_usd_unit
                    )));
                }
                Some(_) => {}
            }
        }
        if self.cost_limit_in_usd < 0.0 || self.cost_limit_in_usd_over_time < 0.0 {
            return Err(StoreError::Validation("cost limits must not be negative".into()));
        }
        if !self.ttl.is_empty() {
            match self.ttl_duration() {
                Some(d) if !d.is_zero() => {}
                _ => {
                    return Err(StoreError::Validation(format!("invalid ttl: {}", self.ttl)));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProviderSetting
// ---------------------------------------------------------------------------

/// Per-setting price overrides in USD per 1k tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMap {
    #[serde(default)]
    pub prompt: HashMap<String, f64>,
    #[serde(default)]
    pub completion: HashMap<String, f64>,
    #[serde(default)]
    pub embeddings: HashMap<String, f64>,
}

impl CostMap {
    pub fn is_empty(&self) -> bool {
        self.prompt.is_empty() && self.completion.is_empty() && self.embeddings.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSetting {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub name: String,
    /// Opaque credential bag (`apikey`, `resourceName`, `awsRegion`, ...).
    #[serde(default)]
    pub setting: HashMap<String, String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub cost_map: Option<CostMap>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProviderSetting {
    /// Non-empty value from the setting bag.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.setting
            .get(field)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.get("apikey")
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.provider.is_empty() {
            return Err(StoreError::Validation("provider is empty".into()));
        }
        match self.provider.as_str() {
            "openai" | "anthropic" | "deepinfra" if self.api_key().is_none() => Err(
                StoreError::Validation(format!("{} setting requires apikey", self.provider)),
            ),
            "azure" if self.api_key().is_none() || self.get("resourceName").is_none() => Err(
                StoreError::Validation("azure setting requires apikey and resourceName".into()),
            ),
            "vllm" if self.get("vllmUrl").is_none() => {
                Err(StoreError::Validation("vllm setting requires vllmUrl".into()))
            }
            "bedrock"
                if self.get("awsAccessKeyId").is_none()
                    || self.get("awsSecretAccessKey").is_none()
                    || self.get("awsRegion").is_none() =>
            {
                Err(StoreError::Validation(
                    "bedrock setting requires awsAccessKeyId, awsSecretAccessKey and awsRegion"
                        .into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// CustomProvider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    pub target_url: String,
    #[serde(default)]
    pub model_location: String,
    #[serde(default)]
    pub request_prompt_location: String,
    #[serde(default)]
    pub response_completion_location: String,
    #[serde(default)]
    pub stream_location: String,
    #[serde(default)]
    pub stream_end_word: String,
    #[serde(default)]
    pub stream_response_completion_location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomProvider {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub authentication_param: String,
    #[serde(default)]
    pub route_configs: Vec<RouteConfig>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CustomProvider {
    pub fn route_config(&self, path: &str) -> Option<&RouteConfig> {
        self.route_configs.iter().find(|rc| rc.path == path)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let name = &self.provider;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(StoreError::Validation(format!(
                "custom provider name must be non-empty without whitespace: {name:?}"
            )));
        }
        if name.to_lowercase() != *name {
            return Err(StoreError::Validation(format!(
                "custom provider name must be lowercase: {name}"
            )));
        }
        if RESERVED_PROVIDERS.contains(&name.as_str()) {
            return Err(StoreError::Validation(format!(
                "custom provider name is reserved: {name}"
            )));
        }
        for rc in &self.route_configs {
            if !rc.path.starts_with('/') {
                return Err(StoreError::Validation(format!(
                    "route config path must start with '/': {}",
                    rc.path
                )));
            }
            url::Url::parse(&rc.target_url).map_err(|e| {
                StoreError::Validation(format!("invalid target_url {:?}: {e}", rc.target_url))
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ttl: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub key_ids: Vec<String>,
    #[serde(default)]
    pub cache_config: CacheConfig,
    #[serde(default)]
    pub request_format: String,
    #[serde(default)]
    pub retry_strategy: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Route {
    pub fn validate(&self) -> Result<(), StoreError> {
        if !self.path.starts_with('/') {
            return Err(StoreError::Validation(format!(
                "route path must start with '/': {}",
                self.path
            )));
        }
        if self.steps.is_empty() {
            return Err(StoreError::Validation("route has no steps".into()));
        }
        if !matches!(self.request_format.as_str(), "" | "chat_completion" | "embeddings") {
            return Err(StoreError::Validation(format!(
                "unsupported request_format: {}",
                self.request_format
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Block,
    #[serde(alias = "warn")]
    AllowButWarn,
    #[serde(alias = "redact")]
    AllowButRedact,
    Allow,
}

/// Fixed PII categories with one action each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticConfig {
    #[serde(default)]
    pub name: Option<PolicyAction>,
    #[serde(default)]
    pub address: Option<PolicyAction>,
    #[serde(default)]
    pub email: Option<PolicyAction>,
    #[serde(default)]
    pub ssn: Option<PolicyAction>,
    #[serde(default)]
    pub password: Option<PolicyAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexRule {
    pub definition: String,
    pub action: PolicyAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    #[serde(default)]
    pub definition: Vec<String>,
    pub action: PolicyAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: SemanticConfig,
    #[serde(default)]
    pub regex_config: Vec<RegexRule>,
    #[serde(default)]
    pub custom_config: Vec<CustomRule>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Policy {
    pub fn validate(&self) -> Result<(), StoreError> {
        for rule in &self.regex_config {
            regex::Regex::new(&rule.definition).map_err(|e| {
                StoreError::Validation(format!("invalid regex {:?}: {e}", rule.definition))
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub created_at: i64,
    pub tags: Vec<String>,
    pub key_id: String,
    pub cost_in_usd: f64,
    pub provider: String,
    pub model: String,
    pub status_code: u16,
    pub prompt_token_count: i64,
    pub completion_token_count: i64,
    pub latency_in_ms: i64,
    pub path: String,
    pub method: String,
    pub custom_id: String,
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ApiKey {
        ApiKey {
            key_id: "k1".into(),
            name: "test".into(),
            key: "hash".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_key_rate_unit_pairing() {
        let mut k = key();
        k.rate_limit_over_time = 2;
        assert!(k.validate().is_err());
        k.rate_limit_unit = "m".into();
        assert!(k.validate().is_ok());
        k.rate_limit_over_time = 0;
        assert!(k.validate().is_err());
    }

    #[test]
    fn test_key_cost_unit_pairing() {
        let mut k = key();
        k.cost_limit_in_usd_unit = "d".into();
        assert!(k.validate().is_err());
        k.cost_limit_in_usd_over_time = 5.0;
        assert!(k.validate().is_ok());
        k.cost_limit_in_usd_unit = "s".into();
        assert!(k.validate().is_err());
    }

    #[test]
    fn test_key_ttl_must_parse() {
        let mut k = key();
        k.ttl = "1h".into();
        assert!(k.validate().is_ok());
        assert_eq!(k.ttl_duration(), Some(Duration::from_secs(3600)));
        k.ttl = "forever".into();
        assert!(k.validate().is_err());
        k.ttl = "0s".into();
        assert!(k.validate().is_err());
    }

    #[test]
    fn test_all_setting_ids_primary_first() {
        let mut k = key();
        k.setting_id = "s1".into();
        k.setting_ids = vec!["s2".into(), "s3".into()];
        let ids: Vec<_> = k.all_setting_ids().collect();
        assert_eq!(ids, ["s1", "s2", "s3"]);

        k.setting_id.clear();
        let ids: Vec<_> = k.all_setting_ids().collect();
        assert_eq!(ids, ["s2", "s3"]);
    }

    #[test]
    fn test_openai_setting_requires_apikey() {
        let mut s = ProviderSetting {
            id: "s".into(),
            provider: "openai".into(),
            ..Default::default()
        };
        assert!(s.validate().is_err());
        s.setting.insert("apikey".into(), String::new());
        assert!(s.validate().is_err());
        s.setting.insert("apikey".into(), "sk-test".into());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_custom_provider_naming() {
        let mut cp = CustomProvider {
            id: "c".into(),
            provider: "acme".into(),
            ..Default::default()
        };
        assert!(cp.validate().is_ok());
        cp.provider = "openai".into();
        assert!(cp.validate().is_err());
        cp.provider = "Acme".into();
        assert!(cp.validate().is_err());
        cp.provider = "ac me".into();
        assert!(cp.validate().is_err());
    }

    #[test]
    fn test_policy_action_aliases() {
        let a: PolicyAction = serde_json::from_str("\"redact\"").unwrap();
        assert_eq!(a, PolicyAction::AllowButRedact);
        let a: PolicyAction = serde_json::from_str("\"allow_but_warn\"").unwrap();
        assert_eq!(a, PolicyAction::AllowButWarn);
    }

    #[test]
    fn test_route_requires_steps() {
        let mut r = Route {
            id: "r".into(),
            name: "r".into(),
            path: "/chat".into(),
            ..Default::default()
        };
        assert!(r.validate().is_err());
        r.steps.push(Step {
            provider: "openai".into(),
            model: "gpt-4".into(),
            params: Default::default(),
        });
        assert!(r.validate().is_ok());
    }
}
