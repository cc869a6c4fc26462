//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use nimbus_core::JobKind;
use nimbus_db::JobFilter;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready once the job store answers a query.
async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .store()
        .count_jobs(JobKind::Analytics, &JobFilter::new().limit(1))
        .await?;
    Ok(Json(json!({ "status": "ready" })))
}
