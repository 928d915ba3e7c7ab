use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use serde_json::json;
use tally_pipeline::PipelineStats;
use tally_store::MetricStore;

pub struct HealthState {
    pub store: Arc<dyn MetricStore>,
    pub stats: Arc<PipelineStats>,
}

pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_live))
        .route("/ready", get(health_ready))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn health_live() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn health_ready(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(ReadyResponse::ready())),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse::unavailable(err.to_string())),
        ),
    }
}

pub async fn stats(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ReadyResponse {
    fn ready() -> Self {
        Self {
            status: "ready",
            error: None,
        }
    }

    fn unavailable(error: String) -> Self {
        Self {
            status: "unavailable",
            error: Some(error),
        }
    }
}
