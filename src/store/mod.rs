//! Durable store boundary.
//!
//! The gateway reads authoritative state through [`Store`] (delta scans for
//! the mirror poller, the auto-revoke write, event persistence and the
//! lifetime spend ledger). The admin façade traits describe the CRUD surface
//! an operator tool drives; the SQLite store implements both.

pub mod sqlite;
pub mod types;

pub use self::sqlite::SqliteStore;
pub use self::types::{
    ApiKey, CostMap, CustomProvider, Event, Policy, ProviderSetting, Route, RouteConfig, Step,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Read and write operations the request path and background tasks need.
///
/// `since` is a unix timestamp; `None` requests a full scan.
pub trait Store: Send + Sync {
    fn keys_since(&self, since: Option<i64>) -> Result<Vec<ApiKey>, StoreError>;

    fn settings_since(&self, since: Option<i64>) -> Result<Vec<ProviderSetting>, StoreError>;

    fn custom_providers_since(&self, since: Option<i64>)
    -> Result<Vec<CustomProvider>, StoreError>;

    fn routes_since(&self, since: Option<i64>) -> Result<Vec<Route>, StoreError>;

    fn policies_since(&self, since: Option<i64>) -> Result<Vec<Policy>, StoreError>;

    /// Flip a key to revoked with the given reason.
    fn revoke_key(&self, key_id: &str, reason: &str) -> Result<(), StoreError>;

    /// Append events and fold them into the daily aggregate, atomically.
    fn record_events(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Lifetime spend of a key in micro-USD.
    fn lifetime_spend(&self, key_id: &str) -> Result<i64, StoreError>;

    /// Add to a key's lifetime spend, returning the new total.
    fn add_lifetime_spend(&self, key_id: &str, delta: i64) -> Result<i64, StoreError>;
}

// ---------------------------------------------------------------------------
// Admin façade
// ---------------------------------------------------------------------------

/// Filter for [`KeyManager::get_keys`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct KeyQuery {
    pub tags: Vec<String>,
    pub key_ids: Vec<String>,
    pub provider: Option<String>,
}

pub trait KeyManager {
    fn get_keys(&self, query: &KeyQuery) -> Result<Vec<ApiKey>, StoreError>;
    fn create_key(&self, key: &ApiKey) -> Result<ApiKey, StoreError>;
    fn update_key(&self, key_id: &str, key: &ApiKey) -> Result<ApiKey, StoreError>;
    fn delete_key(&self, key_id: &str) -> Result<(), StoreError>;
}

pub trait ProviderSettingsManager {
    fn create_setting(&self, setting: &ProviderSetting) -> Result<ProviderSetting, StoreError>;
    fn update_setting(
        &self,
        id: &str,
        setting: &ProviderSetting,
    ) -> Result<ProviderSetting, StoreError>;
    fn get_setting(&self, id: &str) -> Result<ProviderSetting, StoreError>;
    fn get_settings(&self, ids: &[String]) -> Result<Vec<ProviderSetting>, StoreError>;
}

pub trait CustomProvidersManager {
    fn create_custom_provider(&self, cp: &CustomProvider) -> Result<CustomProvider, StoreError>;
    fn get_custom_provider(&self, name: &str) -> Result<CustomProvider, StoreError>;
    fn get_route_config(&self, name: &str, path: &str) -> Result<RouteConfig, StoreError>;
    fn update_custom_provider(
        &self,
        id: &str,
        cp: &CustomProvider,
    ) -> Result<CustomProvider, StoreError>;
}

pub trait RouteManager {
    fn create_route(&self, route: &Route) -> Result<Route, StoreError>;
    fn get_route(&self, path: &str) -> Result<Route, StoreError>;
    fn update_route(&self, id: &str, route: &Route) -> Result<Route, StoreError>;
    fn delete_route(&self, id: &str) -> Result<(), StoreError>;
}

pub trait PoliciesManager {
    fn create_policy(&self, policy: &Policy) -> Result<Policy, StoreError>;
    fn get_policy(&self, id: &str) -> Result<Policy, StoreError>;
    fn update_policy(&self, id: &str, policy: &Policy) -> Result<Policy, StoreError>;
    fn delete_policy(&self, id: &str) -> Result<(), StoreError>;
}
