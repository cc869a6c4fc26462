//! Job cancellation, progress, sequencers and executor results.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use nimbus_core::sequence::NextJobParameters;
use nimbus_core::substrate::JobResultMessage;
use nimbus_core::{JobId, JobKind};
use nimbus_db::JobFilter;
use nimbus_scheduler::{CancelReport, JobProgress, job_progress};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs/{kind}/progress", get(progress))
        .route("/jobs/{kind}/cancel", post(cancel_matching))
        .route("/jobs/{kind}/{id}/cancel", post(cancel))
        .route("/sequencers", post(create_sequencer))
        .route("/results", post(publish_result))
}

fn parse_kind(kind: &str) -> Result<JobKind, ApiError> {
    Ok(kind.parse::<JobKind>()?)
}

/// Filter accepted as query string (progress) or body (bulk cancel).
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    /// Comma separated status names.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub benchmark_id: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl FilterParams {
    pub fn into_filter(self) -> JobFilter {
        let mut filter = JobFilter::new();
        if let Some(status) = self.status {
            filter = filter.status_names(
                status
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
        if let Some(connection_id) = self.connection_id {
            filter = filter.connection(connection_id);
        }
        if let Some(resource_type) = self.resource_type {
            filter = filter.resource_type(resource_type);
        }
        if let Some(benchmark_id) = self.benchmark_id {
            filter = filter.benchmark(benchmark_id);
        }
        if let Some(at) = self.created_after {
            filter = filter.created_after(at);
        }
        if let Some(at) = self.created_before {
            filter = filter.created_before(at);
        }
        filter
    }
}

async fn progress(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<FilterParams>,
) -> Result<Json<JobProgress>, ApiError> {
    let kind = parse_kind(&kind)?;
    let progress = job_progress(
        state.orchestrator.store().as_ref(),
        kind,
        &params.into_filter(),
    )
    .await?;
    Ok(Json(progress))
}

#[derive(Debug, Serialize)]
struct CanceledResponse {
    canceled: JobId,
}

async fn cancel(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<Json<CanceledResponse>, ApiError> {
    let kind = parse_kind(&kind)?;
    let id = JobId::from_uuid(id);
    state.orchestrator.cancellation().cancel(kind, id).await?;
    Ok(Json(CanceledResponse { canceled: id }))
}

async fn cancel_matching(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(params): Json<FilterParams>,
) -> Result<Json<CancelReport>, ApiError> {
    let kind = parse_kind(&kind)?;
    let report = state
        .orchestrator
        .cancellation()
        .cancel_matching(kind, params.into_filter())
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct SequencerRequest {
    dependency_source: JobKind,
    dependency_list: Vec<JobId>,
    next_job: NextJobParameters,
}

#[derive(Debug, Serialize)]
struct SequencerResponse {
    job_id: JobId,
}

async fn create_sequencer(
    State(state): State<AppState>,
    Json(req): Json<SequencerRequest>,
) -> Result<Json<SequencerResponse>, ApiError> {
    let job_id = state
        .orchestrator
        .sequencer()
        .create(req.dependency_source, req.dependency_list, &req.next_job)
        .await?;
    Ok(Json(SequencerResponse { job_id }))
}

/// Accept a result reported by an executor. It is applied asynchronously by
/// the result consumer.
async fn publish_result(
    State(state): State<AppState>,
    Json(message): Json<JobResultMessage>,
) -> Result<StatusCode, ApiError> {
    state.results.publish(&message).await?;
    Ok(StatusCode::ACCEPTED)
}
