//! In-memory read views over the store.
//!
//! Each view is an immutable map behind an [`ArcSwap`]. Request handlers
//! `load()` without locking; the poller builds a new map and swaps it in, so
//! readers never observe a half-applied refresh.

pub mod poller;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::store::{ApiKey, CustomProvider, Policy, ProviderSetting, Route, RouteConfig, Store, StoreError};

pub use self::poller::{PollerConfig, spawn_poller};

type View<K, T> = ArcSwap<HashMap<K, Arc<T>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    pub keys: usize,
    pub settings: usize,
    pub custom_providers: usize,
    pub routes: usize,
    pub policies: usize,
}

#[derive(Default)]
pub struct Mirror {
    /// Keyed by secret hash.
    keys: View<String, ApiKey>,
    settings: View<String, ProviderSetting>,
    /// Keyed by provider name.
    custom_providers: View<String, CustomProvider>,
    /// Keyed by `(provider name, sub-path)`.
    route_configs: View<(String, String), RouteConfig>,
    /// Keyed by path.
    routes: View<String, Route>,
    policies: View<String, Policy>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn key(&self, hash: &str) -> Option<Arc<ApiKey>> {
        self.keys.load().get(hash).cloned()
    }

    pub fn setting(&self, id: &str) -> Option<Arc<ProviderSetting>> {
        self.settings.load().get(id).cloned()
    }

    pub fn custom_provider(&self, name: &str) -> Option<Arc<CustomProvider>> {
        self.custom_providers.load().get(name).cloned()
    }

    pub fn route_config(&self, name: &str, path: &str) -> Option<Arc<RouteConfig>> {
        self.route_configs
            .load()
            .get(&(name.to_string(), path.to_string()))
            .cloned()
    }

    pub fn route(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.load().get(path).cloned()
    }

    pub fn policy(&self, id: &str) -> Option<Arc<Policy>> {
        self.policies.load().get(id).cloned()
    }

    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            keys: self.keys.load().len(),
            settings: self.settings.load().len(),
            custom_providers: self.custom_providers.load().len(),
            routes: self.routes.load().len(),
            policies: self.policies.load().len(),
        }
    }

    // -----------------------------------------------------------------------
    // Writes (poller only)
    // -----------------------------------------------------------------------

    /// Replace every view from a full scan. Entities deleted from the store
    /// disappear here.
    pub fn refresh_full(&self, store: &dyn Store) -> Result<MirrorStats, StoreError> {
        let keys = store.keys_since(None)?;
        let settings = store.settings_since(None)?;
        let custom_providers = store.custom_providers_since(None)?;
        let routes = store.routes_since(None)?;
        let policies = store.policies_since(None)?;

        self.keys.store(Arc::new(index(keys, |k| k.key.clone())));
        self.settings.store(Arc::new(index(settings, |s| s.id.clone())));
        self.custom_providers
            .store(Arc::new(index(custom_providers, |c| c.provider.clone())));
        self.rebuild_route_configs();
        self.routes.store(Arc::new(index(routes, |r| r.path.clone())));
        self.policies.store(Arc::new(index(policies, |p| p.id.clone())));

        Ok(self.stats())
    }

    /// Apply rows updated at or after `since`. Returns the number applied.
    pub fn refresh_delta(&self, store: &dyn Store, since: i64) -> Result<usize, StoreError> {
        let keys = store.keys_since(Some(since))?;
        let settings = store.settings_since(Some(since))?;
        let custom_providers = store.custom_providers_since(Some(since))?;
        let routes = store.routes_since(Some(since))?;
        let policies = store.policies_since(Some(since))?;

        let applied =
            keys.len() + settings.len() + custom_providers.len() + routes.len() + policies.len();

        upsert(&self.keys, keys, |k| k.key.clone(), |k| k.key_id.clone());
        upsert(&self.settings, settings, |s| s.id.clone(), |s| s.id.clone());
        if !custom_providers.is_empty() {
            upsert(
                &self.custom_providers,
                custom_providers,
                |c| c.provider.clone(),
                |c| c.id.clone(),
            );
            self.rebuild_route_configs();
        }
        upsert(&self.routes, routes, |r| r.path.clone(), |r| r.id.clone());
        upsert(&self.policies, policies, |p| p.id.clone(), |p| p.id.clone());

        Ok(applied)
    }

    fn rebuild_route_configs(&self) {
        let providers = self.custom_providers.load();
        let configs = providers
            .values()
            .flat_map(|cp| {
                cp.route_configs.iter().map(|rc| {
                    (
                        (cp.provider.clone(), rc.path.clone()),
                        Arc::new(rc.clone()),
                    )
                })
            })
            .collect();
        self.route_configs.store(Arc::new(configs));
    }
}

fn index<K: Eq + Hash, T>(items: Vec<T>, key: impl Fn(&T) -> K) -> HashMap<K, Arc<T>> {
    items
        .into_iter()
        .map(|item| (key(&item), Arc::new(item)))
        .collect()
}

/// Copy-on-write merge. An entity whose lookup key changed (a rotated hash,
/// a moved route path) is dropped from its old slot by identity first.
fn upsert<T>(
    view: &View<String, T>,
    items: Vec<T>,
    key: impl Fn(&T) -> String,
    identity: impl Fn(&T) -> String,
) {
    if items.is_empty() {
        return;
    }
    let mut next: HashMap<String, Arc<T>> = (**view.load()).clone();
    for item in items {
        let id = identity(&item);
        next.retain(|_, existing| identity(existing) != id);
        next.insert(key(&item), Arc::new(item));
    }
    view.store(Arc::new(next));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::{KeyManager, SqliteStore};

    fn key(id: &str, hash: &str) -> ApiKey {
        ApiKey {
            key_id: id.into(),
            name: id.into(),
            key: hash.into(),
            ..Default::default()
        }
    }

    fn store() -> SqliteStore {
        SqliteStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_full_refresh_populates_views() {
        let store = store();
        store.create_key(&key("k1", "h1")).unwrap();
        let mirror = Mirror::new();
        let stats = mirror.refresh_full(&store).unwrap();
        assert_eq!(stats.keys, 1);
        assert_eq!(mirror.key("h1").unwrap().key_id, "k1");
        assert!(mirror.key("nope").is_none());
    }

    #[test]
    fn test_delta_applies_revocation() {
        let store = store();
        store.create_key(&key("k1", "h1")).unwrap();
        let mirror = Mirror::new();
        mirror.refresh_full(&store).unwrap();

        crate::store::Store::revoke_key(&store, "k1", "expired").unwrap();
        let applied = mirror.refresh_delta(&store, 0).unwrap();
        assert!(applied >= 1);
        assert!(mirror.key("h1").unwrap().revoked);
    }

    #[test]
    fn test_rotated_hash_drops_old_slot() {
        let mirror = Mirror::new();
        upsert(&mirror.keys, vec![key("k1", "old")], |k| k.key.clone(), |k| k.key_id.clone());
        upsert(&mirror.keys, vec![key("k1", "new")], |k| k.key.clone(), |k| k.key_id.clone());
        assert!(mirror.key("old").is_none());
        assert!(mirror.key("new").is_some());
        assert_eq!(mirror.stats().keys, 1);
    }

    #[test]
    fn test_delete_evicted_on_full_refresh_only() {
        let store = store();
        store.create_key(&key("k1", "h1")).unwrap();
        let mirror = Mirror::new();
        mirror.refresh_full(&store).unwrap();

        store.delete_key("k1").unwrap();
        mirror.refresh_delta(&store, 0).unwrap();
        assert!(mirror.key("h1").is_some());

        mirror.refresh_full(&store).unwrap();
        assert!(mirror.key("h1").is_none());
    }

    #[test]
    fn test_route_configs_follow_custom_providers() {
        let mirror = Mirror::new();
        let cp = CustomProvider {
            id: "c1".into(),
            provider: "acme".into(),
            route_configs: vec![RouteConfig {
                path: "/v1/ask".into(),
                target_url: "https://acme.test/ask".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        upsert(
            &mirror.custom_providers,
            vec![cp],
            |c| c.provider.clone(),
            |c| c.id.clone(),
        );
        mirror.rebuild_route_configs();
        assert_eq!(
            mirror.route_config("acme", "/v1/ask").unwrap().target_url,
            "https://acme.test/ask"
        );
        assert!(mirror.route_config("acme", "/v2").is_none());
    }
}
