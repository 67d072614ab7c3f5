use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "server.host") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

/// Humantime strings (`"5s"`, `"3m"`) for `Duration` fields.
mod humantime_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Enumerated settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for CounterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown counter backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryProvider {
    #[default]
    Statsd,
    Prometheus,
}

impl fmt::Display for TelemetryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statsd => write!(f, "statsd"),
            Self::Prometheus => write!(f, "prometheus"),
        }
    }
}

impl FromStr for TelemetryProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "statsd" => Ok(Self::Statsd),
            "prometheus" => Ok(Self::Prometheus),
            other => Err(format!("unknown telemetry provider: {other}")),
        }
    }
}

/// `strict` keeps request and response bodies out of the logs entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    #[default]
    Standard,
    Strict,
}

impl FromStr for PrivacyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown privacy mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub counters: CountersConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstreams: UpstreamsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Grace period for in-flight requests after SIGINT/SIGTERM.
    #[serde(default = "default_shutdown_timeout", with = "humantime_str")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Encryption sidecar. An empty `url` hashes keys locally with SHA-256.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub audience_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CountersConfig {
    #[serde(default)]
    pub backend: CounterBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::Memory,
            redis_url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MirrorConfig {
    #[serde(default = "default_poll_interval", with = "humantime_str")]
    pub poll_interval: Duration,
    /// Overlap subtracted from the last poll time to absorb clock skew.
    #[serde(default = "default_skew", with = "humantime_str")]
    pub skew: Duration,
    /// Every Nth poll is a full scan that also evicts deleted entities.
    #[serde(default = "default_full_reconcile_every")]
    pub full_reconcile_every: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            skew: default_skew(),
            full_reconcile_every: default_full_reconcile_every(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Upstream deadline unless the caller sends `x-request-timeout`.
    #[serde(default = "default_request_timeout", with = "humantime_str")]
    pub default_timeout: Duration,
    #[serde(default)]
    pub strip_user_agent: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_request_timeout(),
            strip_user_agent: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Base URLs of the built-in providers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamsConfig {
    #[serde(default = "default_openai_url")]
    pub openai: String,
    #[serde(default = "default_anthropic_url")]
    pub anthropic: String,
    #[serde(default = "default_deepinfra_url")]
    pub deepinfra: String,
    /// `{resource}` is replaced with the setting's `resourceName`.
    #[serde(default = "default_azure_url")]
    pub azure: String,
    /// Overrides the regional Bedrock runtime endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock_endpoint: Option<String>,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default = "default_azure_api_version")]
    pub azure_api_version: String,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            openai: default_openai_url(),
            anthropic: default_anthropic_url(),
            deepinfra: default_deepinfra_url(),
            azure: default_azure_url(),
            bedrock_endpoint: None,
            anthropic_version: default_anthropic_version(),
            azure_api_version: default_azure_api_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub provider: TelemetryProvider,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            provider: TelemetryProvider::Statsd,
            sample_rate: default_sample_rate(),
        }
    }
}

/// Where the Claude BPE comes from. A local `tokenizer.json` wins over the
/// hub; with neither, Anthropic text is counted with cl100k.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenizerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_path: Option<PathBuf>,
    /// Hugging Face repository to fetch `tokenizer.json` from. Empty disables.
    #[serde(default = "default_anthropic_repo")]
    pub anthropic_repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            anthropic_path: None,
            anthropic_repo: default_anthropic_repo(),
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub mode: PrivacyMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8001
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_db_path() -> PathBuf {
    PathBuf::from("tollgate.db")
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
const fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}
const fn default_skew() -> Duration {
    Duration::from_secs(2)
}
const fn default_full_reconcile_every() -> u32 {
    12
}
const fn default_request_timeout() -> Duration {
    Duration::from_secs(180)
}
const fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_deepinfra_url() -> String {
    "https://api.deepinfra.com/v1/openai".to_string()
}
fn default_azure_url() -> String {
    "https://{resource}.openai.azure.com".to_string()
}
fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}
fn default_azure_api_version() -> String {
    "2023-05-15".to_string()
}
fn default_anthropic_repo() -> String {
    crate::estimator::ClaudeTokenizer::DEFAULT_REPO.to_string()
}

const fn default_sample_rate() -> f64 {
    1.0
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `TOLLGATE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// JSON logs in production or when asked for explicitly.
    pub fn json_logs(&self) -> bool {
        self.logging.json || self.mode == Mode::Production
    }

    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_duration {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = humantime::parse_duration(&val) {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }

        // -- Server --
        env_str!("server.host", "TOLLGATE_SERVER_HOST", self.server.host);
        env_parse!("server.port", "TOLLGATE_SERVER_PORT", self.server.port);
        if let Ok(val) = std::env::var("TOLLGATE_SERVER_CORS_ORIGINS") {
            self.server.cors_origins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            ov.record("server.cors_origins", "TOLLGATE_SERVER_CORS_ORIGINS");
        }
        env_duration!(
            "server.shutdown_timeout",
            "TOLLGATE_SHUTDOWN_TIMEOUT",
            self.server.shutdown_timeout
        );

        // -- Database --
        if let Ok(val) = std::env::var("TOLLGATE_DATABASE_PATH") {
            self.database.path = PathBuf::from(val);
            ov.record("database.path", "TOLLGATE_DATABASE_PATH");
        }

        // -- Encryption sidecar --
        env_str!("encryption.url", "TOLLGATE_ENCRYPTION_URL", self.encryption.url);
        env_str!(
            "encryption.audience_token",
            "TOLLGATE_ENCRYPTION_AUDIENCE",
            self.encryption.audience_token
        );

        // -- Counters --
        env_parse!("counters.backend", "TOLLGATE_COUNTERS_BACKEND", self.counters.backend);
        env_str!("counters.redis_url", "TOLLGATE_REDIS_URL", self.counters.redis_url);

        // -- Mirror --
        env_duration!(
            "mirror.poll_interval",
            "TOLLGATE_POLL_INTERVAL",
            self.mirror.poll_interval
        );

        // -- Proxy --
        env_duration!(
            "proxy.default_timeout",
            "TOLLGATE_PROXY_TIMEOUT",
            self.proxy.default_timeout
        );
        env_bool!(
            "proxy.strip_user_agent",
            "TOLLGATE_STRIP_USER_AGENT",
            self.proxy.strip_user_agent
        );

        // -- Telemetry, privacy, mode --
        env_parse!(
            "telemetry.provider",
            "TOLLGATE_TELEMETRY_PROVIDER",
            self.telemetry.provider
        );
        env_parse!("privacy.mode", "TOLLGATE_PRIVACY_MODE", self.privacy.mode);

        // -- Tokenizer --
        if let Ok(val) = std::env::var("TOLLGATE_ANTHROPIC_TOKENIZER") {
            self.tokenizer.anthropic_path = Some(PathBuf::from(val));
            ov.record("tokenizer.anthropic_path", "TOLLGATE_ANTHROPIC_TOKENIZER");
        }
        env_str!(
            "tokenizer.anthropic_repo",
            "TOLLGATE_ANTHROPIC_TOKENIZER_REPO",
            self.tokenizer.anthropic_repo
        );
        env_parse!("mode", "TOLLGATE_MODE", self.mode);

        // -- Logging --
        env_str!("logging.level", "TOLLGATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "TOLLGATE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
