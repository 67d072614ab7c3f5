use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::types::{ApiKey, CustomProvider, Event, Policy, ProviderSetting, Route, RouteConfig};
use super::{
    CustomProvidersManager, KeyManager, KeyQuery, PoliciesManager, ProviderSettingsManager,
    RouteManager, Store, StoreError,
};
use crate::db::Database;

const SECONDS_PER_DAY: i64 = 86_400;

/// [`Store`] and admin façade over the embedded SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

/// Map unique-constraint failures to a validation error naming the entity.
fn constraint(err: rusqlite::Error, what: &str) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Validation(format!("{what} already exists"))
        }
        other => StoreError::Database(other),
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// `WHERE` clause for a delta scan. `updated_at >= -1` matches every row.
fn since_bound(since: Option<i64>) -> i64 {
    since.unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

const KEY_COLUMNS: &str = "key_id, name, key, revoked, revoked_reason, created_at, updated_at, \
     tags, ttl, cost_limit_in_usd, cost_limit_in_usd_over_time, cost_limit_in_usd_unit, \
     rate_limit_over_time, rate_limit_unit, setting_id, setting_ids, allowed_paths, \
     should_log_request, should_log_response, rotation_enabled, policy_ids";

fn map_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        key_id: row.get(0)?,
        name: row.get(1)?,
        key: row.get(2)?,
        revoked: row.get(3)?,
        revoked_reason: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        tags: json_col(row, 7)?,
        ttl: row.get(8)?,
        cost_limit_in_usd: row.get(9)?,
        cost_limit_in_usd_over_time: row.get(10)?,
        cost_limit_in_usd_unit: row.get(11)?,
        rate_limit_over_time: row.get(12)?,
        rate_limit_unit: row.get(13)?,
        setting_id: row.get(14)?,
        setting_ids: json_col(row, 15)?,
        allowed_paths: json_col(row, 16)?,
        should_log_request: row.get(17)?,
        should_log_response: row.get(18)?,
        rotation_enabled: row.get(19)?,
        policy_ids: json_col(row, 20)?,
    })
}

const SETTING_COLUMNS: &str =
    "id, provider, name, setting, allowed_models, cost_map, created_at, updated_at";

fn map_setting(row: &Row<'_>) -> rusqlite::Result<ProviderSetting> {
    let cost_map: Option<String> = row.get(5)?;
    let cost_map = match cost_map {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };
    Ok(ProviderSetting {
        id: row.get(0)?,
        provider: row.get(1)?,
        name: row.get(2)?,
        setting: json_col(row, 3)?,
        allowed_models: json_col(row, 4)?,
        cost_map,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const CUSTOM_PROVIDER_COLUMNS: &str =
    "id, provider, authentication_param, route_configs, created_at, updated_at";

fn map_custom_provider(row: &Row<'_>) -> rusqlite::Result<CustomProvider> {
    Ok(CustomProvider {
        id: row.get(0)?,
        provider: row.get(1)?,
        authentication_param: row.get(2)?,
        route_configs: json_col(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

const ROUTE_COLUMNS: &str = "id, name, path, steps, key_ids, cache_config, request_format, \
     retry_strategy, created_at, updated_at";

fn map_route(row: &Row<'_>) -> rusqlite::Result<Route> {
    Ok(Route {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        steps: json_col(row, 3)?,
        key_ids: json_col(row, 4)?,
        cache_config: json_col(row, 5)?,
        request_format: row.get(6)?,
        retry_strategy: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const POLICY_COLUMNS: &str =
    "id, name, tags, config, regex_config, custom_config, created_at, updated_at";

fn map_policy(row: &Row<'_>) -> rusqlite::Result<Policy> {
    Ok(Policy {
        id: row.get(0)?,
        name: row.get(1)?,
        tags: json_col(row, 2)?,
        config: json_col(row, 3)?,
        regex_config: json_col(row, 4)?,
        custom_config: json_col(row, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, map)?;
    rows.collect()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Store for SqliteStore {
    fn keys_since(&self, since: Option<i64>) -> Result<Vec<ApiKey>, StoreError> {
        let sql = format!("SELECT {KEY_COLUMNS} FROM keys WHERE updated_at >= ?1");
        Ok(self
            .db
            .with_conn(|conn| query_all(conn, &sql, [since_bound(since)], map_key))?)
    }

    fn settings_since(&self, since: Option<i64>) -> Result<Vec<ProviderSetting>, StoreError> {
        let sql = format!("SELECT {SETTING_COLUMNS} FROM provider_settings WHERE updated_at >= ?1");
        Ok(self
            .db
            .with_conn(|conn| query_all(conn, &sql, [since_bound(since)], map_setting))?)
    }

    fn custom_providers_since(
        &self,
        since: Option<i64>,
    ) -> Result<Vec<CustomProvider>, StoreError> {
        let sql = format!(
            "SELECT {CUSTOM_PROVIDER_COLUMNS} FROM custom_providers WHERE updated_at >= ?1"
        );
        Ok(self
            .db
            .with_conn(|conn| query_all(conn, &sql, [since_bound(since)], map_custom_provider))?)
    }

    fn routes_since(&self, since: Option<i64>) -> Result<Vec<Route>, StoreError> {
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE updated_at >= ?1");
        Ok(self
            .db
            .with_conn(|conn| query_all(conn, &sql, [since_bound(since)], map_route))?)
    }

    fn policies_since(&self, since: Option<i64>) -> Result<Vec<Policy>, StoreError> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM policies WHERE updated_at >= ?1");
        Ok(self
            .db
            .with_conn(|conn| query_all(conn, &sql, [since_bound(since)], map_policy))?)
    }

    fn revoke_key(&self, key_id: &str, reason: &str) -> Result<(), StoreError> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE keys SET revoked = 1, revoked_reason = ?1, updated_at = ?2 \
                 WHERE key_id = ?3",
                params![reason, now(), key_id],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("key {key_id}")));
        }
        Ok(())
    }

    fn record_events(&self, events: &[Event]) -> Result<(), StoreError> {
        let encoded: Vec<String> = events
            .iter()
            .map(|e| to_json(&e.tags))
            .collect::<Result<_, _>>()?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO events (event_id, created_at, tags, key_id, cost_in_usd, \
                     provider, model, status_code, prompt_token_count, completion_token_count, \
                     latency_in_ms, path, method, custom_id, user_id) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )?;
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO event_agg_by_day (time_stamp, key_id, num_of_requests, \
                     cost_in_usd, latency_in_ms, prompt_token_count, completion_token_count, \
                     success_count) VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT (time_stamp, key_id) DO UPDATE SET \
                     num_of_requests = num_of_requests + 1, \
                     cost_in_usd = cost_in_usd + excluded.cost_in_usd, \
                     latency_in_ms = latency_in_ms + excluded.latency_in_ms, \
                     prompt_token_count = prompt_token_count + excluded.prompt_token_count, \
                     completion_token_count = completion_token_count + excluded.completion_token_count, \
                     success_count = success_count + excluded.success_count",
                )?;

                for (event, tags) in events.iter().zip(&encoded) {
                    insert.execute(params![
                        event.id,
                        event.created_at,
                        tags,
                        event.key_id,
                        event.cost_in_usd,
                        event.provider,
                        event.model,
                        event.status_code,
                        event.prompt_token_count,
                        event.completion_token_count,
                        event.latency_in_ms,
                        event.path,
                        event.method,
                        event.custom_id,
                        event.user_id,
                    ])?;

                    let day = event.created_at - event.created_at.rem_euclid(SECONDS_PER_DAY);
                    let success = i64::from(event.status_code == 200);
                    upsert.execute(params![
                        day,
                        event.key_id,
                        event.cost_in_usd,
                        event.latency_in_ms,
                        event.prompt_token_count,
                        event.completion_token_count,
                        success,
                    ])?;
                }
            }
            tx.commit()
        })?;
        Ok(())
    }

    fn lifetime_spend(&self, key_id: &str) -> Result<i64, StoreError> {
        let value = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT micro_usd FROM key_spend WHERE key_id = ?1",
                [key_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(value.unwrap_or(0))
    }

    fn add_lifetime_spend(&self, key_id: &str, delta: i64) -> Result<i64, StoreError> {
        Ok(self.db.with_conn(|conn| {
            conn.query_row(
                "INSERT INTO key_spend (key_id, micro_usd) VALUES (?1, ?2) \
                 ON CONFLICT (key_id) DO UPDATE SET micro_usd = micro_usd + excluded.micro_usd \
                 RETURNING micro_usd",
                params![key_id, delta],
                |row| row.get(0),
            )
        })?)
    }
}

// ---------------------------------------------------------------------------
// Admin façade
// ---------------------------------------------------------------------------

impl SqliteStore {
    fn key_by_id(&self, key_id: &str) -> Result<ApiKey, StoreError> {
        let sql = format!("SELECT {KEY_COLUMNS} FROM keys WHERE key_id = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, [key_id], map_key).optional())?
            .ok_or_else(|| StoreError::NotFound(format!("key {key_id}")))
    }

    fn route_by_id(&self, id: &str) -> Result<Route, StoreError> {
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE id = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, [id], map_route).optional())?
            .ok_or_else(|| StoreError::NotFound(format!("route {id}")))
    }

    fn custom_provider_by_id(&self, id: &str) -> Result<CustomProvider, StoreError> {
        let sql = format!("SELECT {CUSTOM_PROVIDER_COLUMNS} FROM custom_providers WHERE id = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, [id], map_custom_provider).optional())?
            .ok_or_else(|| StoreError::NotFound(format!("custom provider {id}")))
    }

    fn ensure_keys_exist(&self, key_ids: &[String]) -> Result<(), StoreError> {
        for key_id in key_ids {
            let exists: bool = self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT EXISTS (SELECT 1 FROM keys WHERE key_id = ?1)",
                    [key_id],
                    |row| row.get(0),
                )
            })?;
            if !exists {
                return Err(StoreError::Validation(format!(
                    "route references unknown key {key_id}"
                )));
            }
        }
        Ok(())
    }

    fn write_key(&self, key: &ApiKey, insert: bool) -> Result<usize, StoreError> {
        let tags = to_json(&key.tags)?;
        let setting_ids = to_json(&key.setting_ids)?;
        let allowed_paths = to_json(&key.allowed_paths)?;
        let policy_ids = to_json(&key.policy_ids)?;
        let sql = if insert {
            "INSERT INTO keys (key_id, name, key, revoked, revoked_reason, created_at, updated_at, \
             tags, ttl, cost_limit_in_usd, cost_limit_in_usd_over_time, cost_limit_in_usd_unit, \
             rate_limit_over_time, rate_limit_unit, setting_id, setting_ids, allowed_paths, \
             should_log_request, should_log_response, rotation_enabled, policy_ids) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
             ?18, ?19, ?20, ?21)"
        } else {
            "UPDATE keys SET name = ?2, key = ?3, revoked = ?4, revoked_reason = ?5, \
             updated_at = ?7, tags = ?8, ttl = ?9, cost_limit_in_usd = ?10, \
             cost_limit_in_usd_over_time = ?11, cost_limit_in_usd_unit = ?12, \
             rate_limit_over_time = ?13, rate_limit_unit = ?14, setting_id = ?15, \
             setting_ids = ?16, allowed_paths = ?17, should_log_request = ?18, \
             should_log_response = ?19, rotation_enabled = ?20, policy_ids = ?21 \
             WHERE key_id = ?1"
        };
        self.db
            .with_conn(|conn| {
                conn.execute(
                    sql,
                    params![
                        key.key_id,
                        key.name,
                        key.key,
                        key.revoked,
                        key.revoked_reason,
                        key.created_at,
                        key.updated_at,
                        tags,
                        key.ttl,
                        key.cost_limit_in_usd,
                        key.cost_limit_in_usd_over_time,
                        key.cost_limit_in_usd_unit,
                        key.rate_limit_over_time,
                        key.rate_limit_unit,
                        key.setting_id,
                        setting_ids,
                        allowed_paths,
                        key.should_log_request,
                        key.should_log_response,
                        key.rotation_enabled,
                        policy_ids,
                    ],
                )
            })
            .map_err(|e| constraint(e, "key"))
    }

    fn write_setting(&self, s: &ProviderSetting, insert: bool) -> Result<usize, StoreError> {
        let setting = to_json(&s.setting)?;
        let allowed_models = to_json(&s.allowed_models)?;
        let cost_map = s.cost_map.as_ref().map(to_json).transpose()?;
        let sql = if insert {
            "INSERT INTO provider_settings (id, provider, name, setting, allowed_models, cost_map, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        } else {
            "UPDATE provider_settings SET provider = ?2, name = ?3, setting = ?4, \
             allowed_models = ?5, cost_map = ?6, updated_at = ?8 WHERE id = ?1"
        };
        self.db
            .with_conn(|conn| {
                conn.execute(
                    sql,
                    params![
                        s.id,
                        s.provider,
                        s.name,
                        setting,
                        allowed_models,
                        cost_map,
                        s.created_at,
                        s.updated_at,
                    ],
                )
            })
            .map_err(|e| constraint(e, "provider setting"))
    }

    fn write_custom_provider(&self, cp: &CustomProvider, insert: bool) -> Result<usize, StoreError> {
        let route_configs = to_json(&cp.route_configs)?;
        let sql = if insert {
            "INSERT INTO custom_providers (id, provider, authentication_param, route_configs, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        } else {
            "UPDATE custom_providers SET provider = ?2, authentication_param = ?3, \
             route_configs = ?4, updated_at = ?6 WHERE id = ?1"
        };
        self.db
            .with_conn(|conn| {
                conn.execute(
                    sql,
                    params![
                        cp.id,
                        cp.provider,
                        cp.authentication_param,
                        route_configs,
                        cp.created_at,
                        cp.updated_at,
                    ],
                )
            })
            .map_err(|e| constraint(e, "custom provider"))
    }

    fn write_route(&self, r: &Route, insert: bool) -> Result<usize, StoreError> {
        let steps = to_json(&r.steps)?;
        let key_ids = to_json(&r.key_ids)?;
        let cache_config = to_json(&r.cache_config)?;
        let sql = if insert {
            "INSERT INTO routes (id, name, path, steps, key_ids, cache_config, request_format, \
             retry_strategy, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        } else {
            "UPDATE routes SET name = ?2, path = ?3, steps = ?4, key_ids = ?5, cache_config = ?6, \
             request_format = ?7, retry_strategy = ?8, updated_at = ?10 WHERE id = ?1"
        };
        self.db
            .with_conn(|conn| {
                conn.execute(
                    sql,
                    params![
                        r.id,
                        r.name,
                        r.path,
                        steps,
                        key_ids,
                        cache_config,
                        r.request_format,
                        r.retry_strategy,
                        r.created_at,
                        r.updated_at,
                    ],
                )
            })
            .map_err(|e| constraint(e, "route"))
    }

    fn write_policy(&self, p: &Policy, insert: bool) -> Result<usize, StoreError> {
        let tags = to_json(&p.tags)?;
        let config = to_json(&p.config)?;
        let regex_config = to_json(&p.regex_config)?;
        let custom_config = to_json(&p.custom_config)?;
        let sql = if insert {
            "INSERT INTO policies (id, name, tags, config, regex_config, custom_config, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        } else {
            "UPDATE policies SET name = ?2, tags = ?3, config = ?4, regex_config = ?5, \
             custom_config = ?6, updated_at = ?8 WHERE id = ?1"
        };
        self.db
            .with_conn(|conn| {
                conn.execute(
                    sql,
                    params![
                        p.id,
                        p.name,
                        tags,
                        config,
                        regex_config,
                        custom_config,
                        p.created_at,
                        p.updated_at,
                    ],
                )
            })
            .map_err(|e| constraint(e, "policy"))
    }

    fn delete_by_id(&self, table: &str, column: &str, id: &str) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {table} WHERE {column} = ?1");
        let changed = self.db.with_conn(|conn| conn.execute(&sql, [id]))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("{table} {id}")));
        }
        Ok(())
    }
}

fn new_id(id: &str) -> String {
    if id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        id.to_string()
    }
}

impl KeyManager for SqliteStore {
    fn get_keys(&self, query: &KeyQuery) -> Result<Vec<ApiKey>, StoreError> {
        let mut keys = self.keys_since(None)?;
        if !query.key_ids.is_empty() {
            keys.retain(|k| query.key_ids.contains(&k.key_id));
        }
        if !query.tags.is_empty() {
            keys.retain(|k| k.tags.iter().any(|t| query.tags.contains(t)));
        }
        if let Some(provider) = &query.provider {
            let ids: Vec<String> = self.db.with_conn(|conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT id FROM provider_settings WHERE provider = ?1")?;
                let rows = stmt.query_map([provider], |row| row.get(0))?;
                rows.collect()
            })?;
            keys.retain(|k| ids.contains(&k.setting_id));
        }
        Ok(keys)
    }

    fn create_key(&self, key: &ApiKey) -> Result<ApiKey, StoreError> {
        key.validate()?;
        let ts = now();
        let key = ApiKey {
            key_id: new_id(&key.key_id),
            created_at: if key.created_at == 0 { ts } else { key.created_at },
            updated_at: ts,
            ..key.clone()
        };
        self.write_key(&key, true)?;
        Ok(key)
    }

    fn update_key(&self, key_id: &str, key: &ApiKey) -> Result<ApiKey, StoreError> {
        key.validate()?;
        let existing = self.key_by_id(key_id)?;
        let key = ApiKey {
            key_id: existing.key_id,
            created_at: existing.created_at,
            updated_at: now(),
            ..key.clone()
        };
        self.write_key(&key, false)?;
        Ok(key)
    }

    fn delete_key(&self, key_id: &str) -> Result<(), StoreError> {
        self.delete_by_id("keys", "key_id", key_id)
    }
}

impl ProviderSettingsManager for SqliteStore {
    fn create_setting(&self, setting: &ProviderSetting) -> Result<ProviderSetting, StoreError> {
        setting.validate()?;
        let ts = now();
        let setting = ProviderSetting {
            id: new_id(&setting.id),
            created_at: ts,
            updated_at: ts,
            ..setting.clone()
        };
        self.write_setting(&setting, true)?;
        Ok(setting)
    }

    fn update_setting(
        &self,
        id: &str,
        setting: &ProviderSetting,
    ) -> Result<ProviderSetting, StoreError> {
        setting.validate()?;
        let existing = self.get_setting(id)?;
        let setting = ProviderSetting {
            id: existing.id,
            created_at: existing.created_at,
            updated_at: now(),
            ..setting.clone()
        };
        self.write_setting(&setting, false)?;
        Ok(setting)
    }

    fn get_setting(&self, id: &str) -> Result<ProviderSetting, StoreError> {
        let sql = format!("SELECT {SETTING_COLUMNS} FROM provider_settings WHERE id = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, [id], map_setting).optional())?
            .ok_or_else(|| StoreError::NotFound(format!("provider setting {id}")))
    }

    fn get_settings(&self, ids: &[String]) -> Result<Vec<ProviderSetting>, StoreError> {
        ids.iter().map(|id| self.get_setting(id)).collect()
    }
}

impl CustomProvidersManager for SqliteStore {
    fn create_custom_provider(&self, cp: &CustomProvider) -> Result<CustomProvider, StoreError> {
        cp.validate()?;
        let ts = now();
        let cp = CustomProvider {
            id: new_id(&cp.id),
            created_at: ts,
            updated_at: ts,
            ..cp.clone()
        };
        self.write_custom_provider(&cp, true)?;
        Ok(cp)
    }

    fn get_custom_provider(&self, name: &str) -> Result<CustomProvider, StoreError> {
        let sql =
            format!("SELECT {CUSTOM_PROVIDER_COLUMNS} FROM custom_providers WHERE provider = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, [name], map_custom_provider).optional())?
            .ok_or_else(|| StoreError::NotFound(format!("custom provider {name}")))
    }

    fn get_route_config(&self, name: &str, path: &str) -> Result<RouteConfig, StoreError> {
        let cp = self.get_custom_provider(name)?;
        cp.route_config(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("route config {name}{path}")))
    }

    fn update_custom_provider(
        &self,
        id: &str,
        cp: &CustomProvider,
    ) -> Result<CustomProvider, StoreError> {
        cp.validate()?;
        let existing = self.custom_provider_by_id(id)?;
        let cp = CustomProvider {
            id: existing.id,
            created_at: existing.created_at,
            updated_at: now(),
            ..cp.clone()
        };
        self.write_custom_provider(&cp, false)?;
        Ok(cp)
    }
}

impl RouteManager for SqliteStore {
    fn create_route(&self, route: &Route) -> Result<Route, StoreError> {
        route.validate()?;
        self.ensure_keys_exist(&route.key_ids)?;
        let ts = now();
        let route = Route {
            id: new_id(&route.id),
            created_at: ts,
            updated_at: ts,
            ..route.clone()
        };
        self.write_route(&route, true)?;
        Ok(route)
    }

    fn get_route(&self, path: &str) -> Result<Route, StoreError> {
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM routes WHERE path = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, [path], map_route).optional())?
            .ok_or_else(|| StoreError::NotFound(format!("route {path}")))
    }

    fn update_route(&self, id: &str, route: &Route) -> Result<Route, StoreError> {
        route.validate()?;
        self.ensure_keys_exist(&route.key_ids)?;
        let existing = self.route_by_id(id)?;
        let route = Route {
            id: existing.id,
            created_at: existing.created_at,
            updated_at: now(),
            ..route.clone()
        };
        self.write_route(&route, false)?;
        Ok(route)
    }

    fn delete_route(&self, id: &str) -> Result<(), StoreError> {
        self.delete_by_id("routes", "id", id)
    }
}

impl PoliciesManager for SqliteStore {
    fn create_policy(&self, policy: &Policy) -> Result<Policy, StoreError> {
        policy.validate()?;
        let ts = now();
        let policy = Policy {
            id: new_id(&policy.id),
            created_at: ts,
            updated_at: ts,
            ..policy.clone()
        };
        self.write_policy(&policy, true)?;
        Ok(policy)
    }

    fn get_policy(&self, id: &str) -> Result<Policy, StoreError> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM policies WHERE id = ?1");
        self.db
            .with_conn(|conn| conn.query_row(&sql, [id], map_policy).optional())?
            .ok_or_else(|| StoreError::NotFound(format!("policy {id}")))
    }

    fn update_policy(&self, id: &str, policy: &Policy) -> Result<Policy, StoreError> {
        policy.validate()?;
        let existing = self.get_policy(id)?;
        let policy = Policy {
            id: existing.id,
            created_at: existing.created_at,
            updated_at: now(),
            ..policy.clone()
        };
        self.write_policy(&policy, false)?;
        Ok(policy)
    }

    fn delete_policy(&self, id: &str) -> Result<(), StoreError> {
        self.delete_by_id("policies", "id", id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{PathAccess, Step};

    fn store() -> SqliteStore {
        SqliteStore::new(Database::open_in_memory().unwrap())
    }

    fn sample_key(id: &str, hash: &str) -> ApiKey {
        ApiKey {
            key_id: id.into(),
            name: format!("key {id}"),
            key: hash.into(),
            tags: vec!["team-a".into()],
            setting_id: "s1".into(),
            allowed_paths: vec![PathAccess {
                method: "POST".into(),
                path: "/api/providers/openai/v1/chat/completions".into(),
            }],
            ..Default::default()
        }
    }

    fn openai_setting() -> ProviderSetting {
        let mut s = ProviderSetting {
            id: "s1".into(),
            provider: "openai".into(),
            ..Default::default()
        };
        s.setting.insert("apikey".into(), "sk-test".into());
        s
    }

    #[test]
    fn test_create_and_scan_key() {
        let store = store();
        let created = store.create_key(&sample_key("k1", "h1")).unwrap();
        assert!(created.created_at > 0);

        let keys = store.keys_since(None).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "h1");
        assert_eq!(keys[0].tags, vec!["team-a".to_string()]);
        assert_eq!(keys[0].allowed_paths.len(), 1);
    }

    #[test]
    fn test_duplicate_key_hash_is_validation_error() {
        let store = store();
        store.create_key(&sample_key("k1", "same")).unwrap();
        let err = store.create_key(&sample_key("k2", "same")).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_delta_scan_filters_by_updated_at() {
        let store = store();
        store.create_key(&sample_key("k1", "h1")).unwrap();
        let future = now() + 60;
        assert!(store.keys_since(Some(future)).unwrap().is_empty());
        assert_eq!(store.keys_since(Some(now() - 60)).unwrap().len(), 1);
    }

    #[test]
    fn test_revoke_key() {
        let store = store();
        store.create_key(&sample_key("k1", "h1")).unwrap();
        store.revoke_key("k1", "expired").unwrap();

        let key = store.key_by_id("k1").unwrap();
        assert!(key.revoked);
        assert_eq!(key.revoked_reason, "expired");

        assert!(matches!(
            store.revoke_key("missing", "x"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_key_keeps_created_at() {
        let store = store();
        let mut key = sample_key("k1", "h1");
        key.created_at = 1_000;
        store.create_key(&key).unwrap();

        key.name = "renamed".into();
        key.created_at = 5;
        let updated = store.update_key("k1", &key).unwrap();
        assert_eq!(updated.created_at, 1_000);
        assert_eq!(store.key_by_id("k1").unwrap().name, "renamed");
    }

    #[test]
    fn test_get_keys_filters() {
        let store = store();
        store.create_setting(&openai_setting()).unwrap();
        store.create_key(&sample_key("k1", "h1")).unwrap();
        let mut other = sample_key("k2", "h2");
        other.tags = vec!["team-b".into()];
        other.setting_id = "nope".into();
        store.create_key(&other).unwrap();

        let by_tag = store
            .get_keys(&KeyQuery {
                tags: vec!["team-b".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].key_id, "k2");

        let by_provider = store
            .get_keys(&KeyQuery {
                provider: Some("openai".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_provider.len(), 1);
        assert_eq!(by_provider[0].key_id, "k1");
    }

    #[test]
    fn test_delete_key_then_full_scan_omits_it() {
        let store = store();
        store.create_key(&sample_key("k1", "h1")).unwrap();
        store.delete_key("k1").unwrap();
        assert!(store.keys_since(None).unwrap().is_empty());
    }

    #[test]
    fn test_setting_roundtrip_with_cost_map() {
        let store = store();
        let mut setting = openai_setting();
        let mut cost_map = crate::store::CostMap::default();
        cost_map.prompt.insert("gpt-4".into(), 0.02);
        setting.cost_map = Some(cost_map);
        store.create_setting(&setting).unwrap();

        let loaded = store.get_setting("s1").unwrap();
        assert_eq!(loaded.api_key(), Some("sk-test"));
        assert_eq!(loaded.cost_map.unwrap().prompt["gpt-4"], 0.02);
    }

    #[test]
    fn test_route_requires_existing_keys() {
        let store = store();
        let route = Route {
            name: "chat".into(),
            path: "/chat".into(),
            steps: vec![Step {
                provider: "openai".into(),
                model: "gpt-4".into(),
                params: Default::default(),
            }],
            key_ids: vec!["ghost".into()],
            ..Default::default()
        };
        assert!(matches!(
            store.create_route(&route),
            Err(StoreError::Validation(_))
        ));

        store.create_key(&sample_key("ghost", "h1")).unwrap();
        let created = store.create_route(&route).unwrap();
        assert_eq!(store.get_route("/chat").unwrap().id, created.id);

        // Path uniqueness.
        assert!(matches!(
            store.create_route(&Route {
                id: String::new(),
                ..route
            }),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_custom_provider_route_config_lookup() {
        let store = store();
        let cp = CustomProvider {
            provider: "acme".into(),
            authentication_param: "x-acme-key".into(),
            route_configs: vec![RouteConfig {
                path: "/v1/ask".into(),
                target_url: "https://acme.test/ask".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        store.create_custom_provider(&cp).unwrap();

        let rc = store.get_route_config("acme", "/v1/ask").unwrap();
        assert_eq!(rc.target_url, "https://acme.test/ask");
        assert!(store.get_route_config("acme", "/v2/ask").is_err());
    }

    #[test]
    fn test_record_events_aggregates_by_day() {
        let store = store();
        let day = 1_700_006_400; // midnight UTC
        let events = vec![
            Event {
                id: "e1".into(),
                created_at: day + 10,
                key_id: "k1".into(),
                cost_in_usd: 0.5,
                status_code: 200,
                prompt_token_count: 10,
                completion_token_count: 5,
                latency_in_ms: 100,
                ..Default::default()
            },
            Event {
                id: "e2".into(),
                created_at: day + 20,
                key_id: "k1".into(),
                cost_in_usd: 0.25,
                status_code: 429,
                latency_in_ms: 3,
                ..Default::default()
            },
        ];
        store.record_events(&events).unwrap();

        let (requests, cost, latency, success): (i64, f64, i64, i64) = store
            .db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT num_of_requests, cost_in_usd, latency_in_ms, success_count \
                     FROM event_agg_by_day WHERE time_stamp = ?1 AND key_id = 'k1'",
                    [day],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
            })
            .unwrap();
        assert_eq!(requests, 2);
        assert!((cost - 0.75).abs() < 1e-9);
        assert_eq!(latency, 103);
        assert_eq!(success, 1);
    }

    #[test]
    fn test_lifetime_spend_accumulates() {
        let store = store();
        assert_eq!(store.lifetime_spend("k1").unwrap(), 0);
        assert_eq!(store.add_lifetime_spend("k1", 25).unwrap(), 25);
        assert_eq!(store.add_lifetime_spend("k1", 9_000_000_000).unwrap(), 9_000_000_025);
        assert_eq!(store.lifetime_spend("k1").unwrap(), 9_000_000_025);
    }
}
