use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;

use tollgate::auth::{LocalEncryptor, sha256_key};
use tollgate::config::Config;
use tollgate::db::Database;
use tollgate::estimator::TokenCounter;
use tollgate::events::EventRecorder;
use tollgate::limits::MemoryCounters;
use tollgate::net::HttpClient;
use tollgate::store::{ApiKey, Event, ProviderSetting, ProviderSettingsManager, SqliteStore};
use tollgate::telemetry::NoopTelemetry;
use tollgate::{AppState, Collaborators, build_app};

pub const RAW_KEY: &str = "tg-test-key";

/// A gateway over an in-memory store. Events are kept on the channel so
/// tests can read exactly what was recorded.
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub state: AppState,
    pub events: UnboundedReceiver<Event>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        let (recorder, events) = EventRecorder::channel();
        let state = AppState::new(
            config,
            Collaborators {
                store: store.clone(),
                counters: Arc::new(MemoryCounters::new()),
                encryptor: Arc::new(LocalEncryptor),
                telemetry: Arc::new(NoopTelemetry),
                recorder,
                client: HttpClient::new(),
                tokens: TokenCounter::default(),
            },
        );
        Self {
            store,
            state,
            events,
        }
    }

    pub fn setting(&self, id: &str, provider: &str, pairs: &[(&str, &str)]) -> ProviderSetting {
        self.store
            .create_setting(&ProviderSetting {
                id: id.to_string(),
                provider: provider.to_string(),
                setting: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            })
            .unwrap()
    }

    /// Reload the mirror from the store.
    pub fn sync(&self) {
        self.state.mirror.refresh_full(self.store.as_ref()).unwrap();
    }

    pub fn app(&self) -> Router {
        build_app(self.state.clone())
    }

    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app().oneshot(req).await.unwrap()
    }

    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("event emitted in time")
            .expect("recorder open")
    }
}

/// A key carrying the test secret, bound to `setting_id`.
pub fn key(setting_id: &str) -> ApiKey {
    ApiKey {
        key_id: "key-1".into(),
        name: "test".into(),
        key: sha256_key(RAW_KEY),
        setting_id: setting_id.into(),
        ..Default::default()
    }
}

pub fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", format!("Bearer {RAW_KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
