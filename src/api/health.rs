use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;
use crate::mirror::MirrorStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub mirror: MirrorStats,
}

/// GET /api/health
///
/// Liveness plus the size of each mirrored view. Bypasses governance.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        mirror: state.mirror.stats(),
    })
}
