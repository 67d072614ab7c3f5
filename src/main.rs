//! Tollgate -- governed reverse proxy for LLM provider APIs.
//!
//! Entry point. Wires together:
//!   - Configuration loading
//!   - Store, mirror and poller
//!   - Counters, key hashing and the event recorder
//!   - The governed HTTP server
//!   - Graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use tollgate::auth::{Encryptor, LocalEncryptor, SidecarEncryptor};
use tollgate::config::{Config, CounterBackend};
use tollgate::db::Database;
use tollgate::estimator::{ClaudeTokenizer, TokenCounter};
use tollgate::events::{EventRecorder, spawn_event_recorder};
use tollgate::limits::{Counters, MemoryCounters, RedisCounters};
use tollgate::mirror::{PollerConfig, spawn_poller};
use tollgate::net::HttpClient;
use tollgate::store::{SqliteStore, Store};
use tollgate::telemetry::{Telemetry, TracingTelemetry};
use tollgate::{AppState, Collaborators, build_app};

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: PathBuf,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = PathBuf::from("tollgate.toml");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = PathBuf::from(path);
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("tollgate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
tollgate {version} -- LLM provider gateway

USAGE:
    tollgate [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: tollgate.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    TOLLGATE_CONFIG        Alternative to --config flag
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration
    let cli = parse_args();
    let config_path = std::env::var("TOLLGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or(cli.config_path);
    let config = Config::load(&config_path)?;

    // 2. Logging
    init_tracing(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        mode = ?config.mode,
        "Starting tollgate"
    );
    for (key, var) in config.env_overrides.all() {
        tracing::debug!(setting = %key, env = %var, "Setting overridden from environment");
    }

    // Load BPE tables before the first request pays for it.
    tokio::task::spawn_blocking(tollgate::estimator::tokenizer::preload).await?;
    let tokens = build_token_counter(&config).await?;

    // 3. Store
    let db = Database::open(&config.database.path)
        .with_context(|| format!("opening store at {}", config.database.path.display()))?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(db));
    tracing::info!(path = %config.database.path.display(), "Store opened");

    // 4. Collaborators
    let telemetry: Arc<dyn Telemetry> =
        Arc::new(TracingTelemetry::new(config.telemetry.provider.to_string()));
    let client = HttpClient::builder()
        .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build();
    let encryptor = build_encryptor(&config, client.clone()).await?;
    let counters = build_counters(&config).await?;
    let (recorder, events_rx) = EventRecorder::channel();

    let state = AppState::new(
        config.clone(),
        Collaborators {
            store: store.clone(),
            counters,
            encryptor,
            telemetry: telemetry.clone(),
            recorder,
            client,
            tokens,
        },
    );

    // 5. Mirror: full load now, then the poller keeps it fresh
    let stats = {
        let mirror = state.mirror.clone();
        let store = store.clone();
        tokio::task::spawn_blocking(move || mirror.refresh_full(store.as_ref())).await??
    };
    tracing::info!(
        keys = stats.keys,
        settings = stats.settings,
        custom_providers = stats.custom_providers,
        routes = stats.routes,
        policies = stats.policies,
        "Mirror loaded"
    );
    let _poller = spawn_poller(
        state.mirror.clone(),
        store.clone(),
        telemetry.clone(),
        PollerConfig {
            interval: config.mirror.poll_interval,
            skew: config.mirror.skew,
            full_reconcile_every: config.mirror.full_reconcile_every,
        },
    );
    let recorder_handle = spawn_event_recorder(store, telemetry, events_rx);

    // 6. Serve
    let app = build_app(state);
    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Drain. The router (and every recorder handle in it) is gone, so the
    // event writer flushes what is buffered and exits.
    tracing::info!("Shutting down gracefully");
    if tokio::time::timeout(config.server.shutdown_timeout, recorder_handle)
        .await
        .is_err()
    {
        tracing::warn!(
            timeout = ?config.server.shutdown_timeout,
            "Event recorder did not drain before the shutdown timeout"
        );
    }

    Ok(())
}

/// Sidecar hashing when configured, checked once before serving.
async fn build_encryptor(config: &Config, client: HttpClient) -> anyhow::Result<Arc<dyn Encryptor>> {
    if config.encryption.url.is_empty() {
        tracing::warn!("No encryption sidecar configured; hashing keys locally");
        return Ok(Arc::new(LocalEncryptor));
    }
    let sidecar = SidecarEncryptor::new(
        client,
        config.encryption.url.clone(),
        config.encryption.audience_token.clone(),
    );
    sidecar
        .encrypt("tollgate-health-check")
        .await
        .context("encryption sidecar health check failed")?;
    tracing::info!(url = %config.encryption.url, "Encryption sidecar reachable");
    Ok(Arc::new(sidecar))
}

/// The Claude BPE from a configured file (fatal if unreadable), else from
/// the hub. A failed download falls back to cl100k counting.
async fn build_token_counter(config: &Config) -> anyhow::Result<TokenCounter> {
    let cfg = &config.tokenizer;
    if let Some(path) = cfg.anthropic_path.clone() {
        let claude = tokio::task::spawn_blocking(move || ClaudeTokenizer::from_file(&path))
            .await?
            .context("loading tokenizer.anthropic_path")?;
        tracing::info!("Claude tokenizer loaded from file");
        return Ok(TokenCounter::with_claude(claude));
    }
    if cfg.anthropic_repo.is_empty() {
        tracing::warn!("No Claude tokenizer configured; counting Anthropic text with cl100k");
        return Ok(TokenCounter::default());
    }
    match ClaudeTokenizer::from_hub(&cfg.anthropic_repo, cfg.cache_dir.as_deref()).await {
        Ok(claude) => {
            tracing::info!(repo = %cfg.anthropic_repo, "Claude tokenizer loaded");
            Ok(TokenCounter::with_claude(claude))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Claude tokenizer unavailable; counting Anthropic text with cl100k");
            Ok(TokenCounter::default())
        }
    }
}

async fn build_counters(config: &Config) -> anyhow::Result<Arc<dyn Counters>> {
    Ok(match config.counters.backend {
        CounterBackend::Memory => {
            tracing::info!("Using in-process rate counters");
            Arc::new(MemoryCounters::new())
        }
        CounterBackend::Redis => {
            let counters = RedisCounters::new(&config.counters.redis_url)
                .context("invalid counters.redis_url")?;
            if let Err(e) = counters.ping().await {
                tracing::warn!(error = %e, "Redis unreachable; counter reads fail open until it recovers");
            }
            tracing::info!("Using redis rate counters");
            Arc::new(counters)
        }
    })
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("tollgate={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.json_logs() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
