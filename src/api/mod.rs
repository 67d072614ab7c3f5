pub mod health;

use axum::Router;
use axum::middleware;
use axum::routing::{any, get, post};

use crate::AppState;
use crate::proxy::{governance, proxy_handler, route_handler};

/// Build the API router.
///
/// Route layout:
/// ```text
/// /api/health                                  GET   (no governance)
/// /api/providers/{provider}/{*rest}            ANY
/// /api/custom/providers/{provider}/{*rest}     ANY
/// /api/routes/{*route}                         POST
/// ```
pub fn build_api_router(state: AppState) -> Router<AppState> {
    let proxied = Router::new()
        .route("/api/providers/{provider}/{*rest}", any(proxy_handler))
        .route("/api/custom/providers/{provider}/{*rest}", any(proxy_handler))
        .route("/api/routes/{*route}", post(route_handler))
        .layer(middleware::from_fn_with_state(state, governance));

    Router::new()
        .route("/api/health", get(health::health_check))
        .merge(proxied)
}
