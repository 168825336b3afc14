//! Job API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use gradeflow_core::{
    AddSubmissionRequest, CreateJobRequest, Job, JobFilter, Page, Submission, WorkStatus,
};

use super::error::{engine_error, parse_status, ApiError};
use crate::state::AppState;

/// Maximum allowed limit for job queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for job queries
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    /// Filter by owning batch
    pub batch_id: Option<String>,
    /// Filter by status
    pub status: Option<String>,
    /// Filter by provider lane
    pub provider: Option<String>,
    /// Minimum scheduling priority (inclusive)
    pub min_priority: Option<u8>,
    /// Maximum scheduling priority (inclusive)
    pub max_priority: Option<u8>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state
        .controller()
        .create_job(body)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Page<Job>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = JobFilter::new()
        .with_limit(limit)
        .with_offset(offset)
        .with_priority_range(params.min_priority, params.max_priority);

    if let Some(status) = parse_status::<WorkStatus>(params.status.as_deref())? {
        filter = filter.with_status(status);
    }
    if let Some(batch_id) = params.batch_id {
        filter = filter.with_batch(batch_id);
    }
    if let Some(provider) = params.provider {
        filter = filter.with_provider(provider);
    }

    state
        .query()
        .list_jobs(&filter)
        .map(Json)
        .map_err(engine_error)
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state.query().get_job(&id).map(Json).map_err(engine_error)
}

/// Add one queued submission to a draft or pending job
pub async fn add_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AddSubmissionRequest>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let submission = state
        .controller()
        .add_submission(&id, body)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(submission)))
}

// ============================================================================
// Control actions
// ============================================================================

pub async fn mark_ready(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .controller()
        .mark_ready_job(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .controller()
        .start_job(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}

pub async fn pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .controller()
        .pause_job(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}

pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .controller()
        .resume_job(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .controller()
        .cancel_job(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}

pub async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .controller()
        .retry_failed_job(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}

pub async fn duplicate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state
        .controller()
        .duplicate_job(&id)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Jobs are archived with their batch; this always answers 409.
pub async fn archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .controller()
        .archive_job(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(job))
}
