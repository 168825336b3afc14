//! Batch API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use gradeflow_core::{
    Batch, BatchAnalytics, BatchFilter, CreateBatchRequest, Page, WorkStatus,
};

use super::error::{engine_error, parse_status, ApiError};
use crate::state::AppState;

/// Maximum allowed limit for batch queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for batch queries
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for listing batches
#[derive(Debug, Deserialize)]
pub struct ListBatchesParams {
    /// Filter by status (e.g. "processing")
    pub status: Option<String>,
    pub min_priority: Option<u8>,
    pub max_priority: Option<u8>,
    /// Filter by tag
    pub tag: Option<String>,
    /// Filter by owner
    pub owner: Option<String>,
    /// Maximum number of batches to return (default 100, max 1000)
    pub limit: Option<i64>,
    /// Pagination offset (default 0)
    pub offset: Option<i64>,
}

pub async fn create_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<Batch>), ApiError> {
    let batch = state
        .controller()
        .create_batch(body)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(batch)))
}

pub async fn list_batches(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListBatchesParams>,
) -> Result<Json<Page<Batch>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = BatchFilter::new()
        .with_priority_range(params.min_priority, params.max_priority)
        .with_limit(limit)
        .with_offset(offset);

    if let Some(status) = parse_status::<WorkStatus>(params.status.as_deref())? {
        filter = filter.with_status(status);
    }
    if let Some(tag) = params.tag {
        filter = filter.with_tag(tag);
    }
    if let Some(owner) = params.owner {
        filter = filter.with_owner(owner);
    }

    state
        .query()
        .list_batches(&filter)
        .map(Json)
        .map_err(engine_error)
}

pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    state.query().get_batch(&id).map(Json).map_err(engine_error)
}

pub async fn get_analytics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BatchAnalytics>, ApiError> {
    state
        .query()
        .batch_analytics(&id)
        .map(Json)
        .map_err(engine_error)
}

// ============================================================================
// Control actions
// ============================================================================

pub async fn mark_ready(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    let batch = state
        .controller()
        .mark_ready_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(batch))
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    let batch = state
        .controller()
        .start_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(batch))
}

pub async fn pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    let batch = state
        .controller()
        .pause_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(batch))
}

pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    let batch = state
        .controller()
        .resume_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(batch))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    let batch = state
        .controller()
        .cancel_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(batch))
}

pub async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    let batch = state
        .controller()
        .retry_failed_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(batch))
}

pub async fn duplicate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Batch>), ApiError> {
    let batch = state
        .controller()
        .duplicate_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::CREATED, Json(batch)))
}

pub async fn archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ApiError> {
    let batch = state
        .controller()
        .archive_batch(&id)
        .await
        .map_err(engine_error)?;
    Ok(Json(batch))
}
