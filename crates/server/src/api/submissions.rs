use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use gradeflow_core::{Page, Submission, SubmissionFilter, SubmissionStatus};

use super::error::{engine_error, parse_status, ApiError};
use crate::state::AppState;

const MAX_LIMIT: i64 = 1000;
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for listing submissions
#[derive(Debug, Deserialize)]
pub struct ListSubmissionsParams {
    pub job_id: Option<String>,
    /// Filter by status (e.g. "in_progress")
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListSubmissionsParams>,
) -> Result<Json<Page<Submission>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = SubmissionFilter::new()
        .with_limit(limit)
        .with_offset(offset);

    if let Some(status) = parse_status::<SubmissionStatus>(params.status.as_deref())? {
        filter = filter.with_status(status);
    }
    if let Some(job_id) = params.job_id {
        filter = filter.with_job(job_id);
    }

    state
        .query()
        .list_submissions(&filter)
        .map(Json)
        .map_err(engine_error)
}

pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Submission>, ApiError> {
    state
        .query()
        .get_submission(&id)
        .map(Json)
        .map_err(engine_error)
}
