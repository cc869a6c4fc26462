//! Manual describe and benchmark triggers.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use nimbus_core::JobId;
use nimbus_core::resource::TriggerType;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/describe", post(trigger_describe))
        .route("/benchmarks/{benchmark_id}", post(trigger_benchmark))
}

#[derive(Debug, Deserialize)]
struct DescribeRequest {
    connection_id: String,
    resource_types: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DescribeResponse {
    job_ids: Vec<JobId>,
}

async fn trigger_describe(
    State(state): State<AppState>,
    Json(req): Json<DescribeRequest>,
) -> Result<Json<DescribeResponse>, ApiError> {
    if req.resource_types.is_empty() {
        return Err(ApiError::BadRequest("resource_types is empty".to_string()));
    }
    let job_ids = state
        .orchestrator
        .describe()
        .trigger_describe(&req.connection_id, &req.resource_types, TriggerType::Manual)
        .await?;
    Ok(Json(DescribeResponse { job_ids }))
}

#[derive(Debug, Deserialize)]
struct BenchmarkRequest {
    connection_ids: Vec<String>,
    #[serde(default)]
    control_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job_id: JobId,
}

async fn trigger_benchmark(
    State(state): State<AppState>,
    Path(benchmark_id): Path<String>,
    Json(req): Json<BenchmarkRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = state
        .orchestrator
        .compliance()
        .trigger_benchmark(
            &benchmark_id,
            &req.connection_ids,
            &req.control_ids,
            TriggerType::Manual,
        )
        .await?;
    Ok(Json(JobResponse { job_id }))
}
