pub mod api;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod estimator;
pub mod events;
pub mod limits;
pub mod mirror;
pub mod net;
pub mod policy;
pub mod proxy;
pub mod routes;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::auth::Encryptor;
use crate::bridge::Upstreams;
use crate::config::{Config, PrivacyMode};
use crate::estimator::{Estimator, TokenCounter};
use crate::events::EventRecorder;
use crate::limits::validator::Validator;
use crate::limits::{Counters, Limits};
use crate::mirror::Mirror;
use crate::net::HttpClient;
use crate::policy::PolicyEngine;
use crate::policy::pii::RegexPiiDetector;
use crate::proxy::emitter::EmitSink;
use crate::store::Store;
use crate::telemetry::Telemetry;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub mirror: Arc<Mirror>,
    pub store: Arc<dyn Store>,
    pub limits: Arc<Limits>,
    pub validator: Arc<Validator>,
    pub estimator: Arc<Estimator>,
    pub encryptor: Arc<dyn Encryptor>,
    pub telemetry: Arc<dyn Telemetry>,
    pub recorder: EventRecorder,
    pub policies: Arc<PolicyEngine>,
    pub upstreams: Arc<Upstreams>,
}

/// The collaborators a gateway is assembled from.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub counters: Arc<dyn Counters>,
    pub encryptor: Arc<dyn Encryptor>,
    pub telemetry: Arc<dyn Telemetry>,
    pub recorder: EventRecorder,
    pub client: HttpClient,
    pub tokens: TokenCounter,
}

impl AppState {
    pub fn new(config: Config, parts: Collaborators) -> Self {
        let estimator = Arc::new(Estimator::with_counter(parts.tokens));
        let limits = Arc::new(Limits::new(parts.counters, parts.store.clone()));

        let mut upstreams = Upstreams::new(
            parts.client,
            estimator.clone(),
            parts.telemetry.clone(),
            config.upstreams.clone(),
        );
        upstreams.strip_user_agent = config.proxy.strip_user_agent;
        upstreams.log_bodies = config.privacy.mode != PrivacyMode::Strict;

        Self {
            config: Arc::new(config),
            mirror: Arc::new(Mirror::new()),
            store: parts.store,
            validator: Arc::new(Validator::new(limits.clone(), parts.telemetry.clone())),
            limits,
            estimator,
            encryptor: parts.encryptor,
            telemetry: parts.telemetry,
            recorder: parts.recorder,
            policies: Arc::new(PolicyEngine::new(Arc::new(RegexPiiDetector))),
            upstreams: Arc::new(upstreams),
        }
    }

    pub fn emit_sink(&self) -> EmitSink {
        EmitSink {
            recorder: self.recorder.clone(),
            limits: self.limits.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Build the application router with all middleware layers.
pub fn build_app(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    // -- Request ID layer (X-Request-ID) --------------------------------------
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    api::build_api_router(state.clone())
        .layer(CatchPanicLayer::new())
        .layer(propagate_id)
        .layer(request_id)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Permissive when no origins are configured.
pub fn build_cors_layer(config: &Config) -> CorsLayer {
    if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
