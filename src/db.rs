use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Thread-safe database handle wrapping a SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path with WAL mode.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        // A panic while holding the lock leaves the connection usable.
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(())
    }
}

// Array and jsonb columns are stored as JSON text; timestamps are unix seconds.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS keys (
    key_id                          TEXT PRIMARY KEY,
    name                            TEXT NOT NULL,
    created_at                      INTEGER NOT NULL,
    updated_at                      INTEGER NOT NULL,
    tags                            TEXT NOT NULL DEFAULT '[]',
    revoked                         INTEGER NOT NULL DEFAULT 0,
    key                             TEXT NOT NULL UNIQUE,
    revoked_reason                  TEXT NOT NULL DEFAULT '',
    cost_limit_in_usd               REAL NOT NULL DEFAULT 0,
    cost_limit_in_usd_over_time     REAL NOT NULL DEFAULT 0,
    cost_limit_in_usd_unit          TEXT NOT NULL DEFAULT '',
    rate_limit_over_time            INTEGER NOT NULL DEFAULT 0,
    rate_limit_unit                 TEXT NOT NULL DEFAULT '',
    ttl                             TEXT NOT NULL DEFAULT '',
    setting_id                      TEXT NOT NULL DEFAULT '',
    allowed_paths                   TEXT NOT NULL DEFAULT '[]',
    setting_ids                     TEXT NOT NULL DEFAULT '[]',
    should_log_request              INTEGER NOT NULL DEFAULT 0,
    should_log_response             INTEGER NOT NULL DEFAULT 0,
    rotation_enabled                INTEGER NOT NULL DEFAULT 0,
    policy_ids                      TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_keys_updated ON keys(updated_at);

CREATE TABLE IF NOT EXISTS provider_settings (
    id              TEXT PRIMARY KEY,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    provider        TEXT NOT NULL,
    setting         TEXT NOT NULL DEFAULT '{}',
    name            TEXT NOT NULL DEFAULT '',
    allowed_models  TEXT NOT NULL DEFAULT '[]',
    cost_map        TEXT
);
CREATE INDEX IF NOT EXISTS idx_provider_settings_updated ON provider_settings(updated_at);

CREATE TABLE IF NOT EXISTS custom_providers (
    id                      TEXT PRIMARY KEY,
    created_at              INTEGER NOT NULL,
    updated_at              INTEGER NOT NULL,
    provider                TEXT NOT NULL UNIQUE,
    route_configs           TEXT NOT NULL DEFAULT '[]',
    authentication_param    TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_custom_providers_updated ON custom_providers(updated_at);

CREATE TABLE IF NOT EXISTS routes (
    id              TEXT PRIMARY KEY,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    name            TEXT NOT NULL,
    path            TEXT NOT NULL UNIQUE,
    key_ids         TEXT NOT NULL DEFAULT '[]',
    steps           TEXT NOT NULL DEFAULT '[]',
    cache_config    TEXT NOT NULL DEFAULT '{}',
    request_format  TEXT NOT NULL DEFAULT '',
    retry_strategy  TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_routes_updated ON routes(updated_at);

CREATE TABLE IF NOT EXISTS policies (
    id              TEXT PRIMARY KEY,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    name            TEXT NOT NULL,
    tags            TEXT NOT NULL DEFAULT '[]',
    config          TEXT NOT NULL DEFAULT '{}',
    regex_config    TEXT NOT NULL DEFAULT '[]',
    custom_config   TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_policies_updated ON policies(updated_at);

CREATE TABLE IF NOT EXISTS events (
    event_id                TEXT PRIMARY KEY,
    created_at              INTEGER NOT NULL,
    tags                    TEXT NOT NULL DEFAULT '[]',
    key_id                  TEXT NOT NULL DEFAULT '',
    cost_in_usd             REAL NOT NULL DEFAULT 0,
    provider                TEXT NOT NULL DEFAULT '',
    model                   TEXT NOT NULL DEFAULT '',
    status_code             INTEGER NOT NULL,
    prompt_token_count      INTEGER NOT NULL DEFAULT 0,
    completion_token_count  INTEGER NOT NULL DEFAULT 0,
    latency_in_ms           INTEGER NOT NULL DEFAULT 0,
    path                    TEXT NOT NULL DEFAULT '',
    method                  TEXT NOT NULL DEFAULT '',
    custom_id               TEXT NOT NULL DEFAULT '',
    user_id                 TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_events_key ON events(key_id);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);

CREATE TABLE IF NOT EXISTS event_agg_by_day (
    time_stamp              INTEGER NOT NULL,
    key_id                  TEXT NOT NULL,
    num_of_requests         INTEGER NOT NULL DEFAULT 0,
    cost_in_usd             REAL NOT NULL DEFAULT 0,
    latency_in_ms           INTEGER NOT NULL DEFAULT 0,
    prompt_token_count      INTEGER NOT NULL DEFAULT 0,
    completion_token_count  INTEGER NOT NULL DEFAULT 0,
    success_count           INTEGER NOT NULL DEFAULT 0,
    UNIQUE (time_stamp, key_id)
);

CREATE TABLE IF NOT EXISTS key_spend (
    key_id      TEXT PRIMARY KEY,
    micro_usd   INTEGER NOT NULL DEFAULT 0
);
"#;
