use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use gradeflow_core::{EventFilter, EventRecord, EventSubject, Page};

use super::error::{internal_error, parse_status, ApiError};
use crate::state::AppState;

/// Maximum allowed limit for event queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for event queries
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for the event log endpoint
#[derive(Debug, Deserialize)]
pub struct EventQueryParams {
    /// Filter by level: service, batch, job or submission
    pub subject: Option<String>,
    /// Filter by batch, job or submission ID
    pub entity_id: Option<String>,
    /// Filter by owning job ID
    pub job_id: Option<String>,
    /// Filter by event type (e.g. "status_changed")
    pub event_type: Option<String>,
    /// Filter events after this timestamp (ISO 8601)
    pub from: Option<DateTime<Utc>>,
    /// Filter events before this timestamp (ISO 8601)
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of events to return (default 100, max 1000)
    pub limit: Option<i64>,
    /// Pagination offset (default 0)
    pub offset: Option<i64>,
}

/// Query the engine event log, newest first
pub async fn query_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventQueryParams>,
) -> Result<Json<Page<EventRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    // Shared between query and count
    let mut base_filter = EventFilter::new();

    if let Some(subject) = parse_status::<EventSubject>(params.subject.as_deref())? {
        base_filter = base_filter.with_subject(subject);
    }

    if let Some(ref entity_id) = params.entity_id {
        base_filter = base_filter.with_entity_id(entity_id);
    }
    if let Some(ref job_id) = params.job_id {
        base_filter = base_filter.with_job_id(job_id);
    }
    if let Some(ref event_type) = params.event_type {
        base_filter = base_filter.with_event_type(event_type);
    }
    if params.from.is_some() || params.to.is_some() {
        base_filter = base_filter.with_time_range(params.from, params.to);
    }

    let total = state
        .event_store()
        .count(&base_filter)
        .map_err(|e| internal_error(format!("Failed to count events: {}", e)))?;

    let query_filter = base_filter.page(limit, offset);
    let items = state
        .event_store()
        .query(&query_filter)
        .map_err(|e| internal_error(format!("Failed to query events: {}", e)))?;

    Ok(Json(Page {
        items,
        total,
        limit,
        offset,
    }))
}
