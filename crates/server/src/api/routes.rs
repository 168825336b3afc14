use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{batches, events, handlers, jobs, middleware::metrics_middleware, submissions};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health, config, observability
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/metrics", get(handlers::get_metrics))
        .route("/scheduler/status", get(handlers::scheduler_status))
        .route("/events", get(events::query_events))
        // Batches
        .route(
            "/batches",
            post(batches::create_batch).get(batches::list_batches),
        )
        .route("/batches/{id}", get(batches::get_batch))
        .route("/batches/{id}/analytics", get(batches::get_analytics))
        .route("/batches/{id}/ready", post(batches::mark_ready))
        .route("/batches/{id}/start", post(batches::start))
        .route("/batches/{id}/pause", post(batches::pause))
        .route("/batches/{id}/resume", post(batches::resume))
        .route("/batches/{id}/cancel", post(batches::cancel))
        .route("/batches/{id}/retry-failed", post(batches::retry_failed))
        .route("/batches/{id}/duplicate", post(batches::duplicate))
        .route("/batches/{id}/archive", post(batches::archive))
        // Jobs
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/submissions", post(jobs::add_submission))
        .route("/jobs/{id}/ready", post(jobs::mark_ready))
        .route("/jobs/{id}/start", post(jobs::start))
        .route("/jobs/{id}/pause", post(jobs::pause))
        .route("/jobs/{id}/resume", post(jobs::resume))
        .route("/jobs/{id}/cancel", post(jobs::cancel))
        .route("/jobs/{id}/retry-failed", post(jobs::retry_failed))
        .route("/jobs/{id}/duplicate", post(jobs::duplicate))
        .route("/jobs/{id}/archive", post(jobs::archive))
        // Submissions
        .route("/submissions", get(submissions::list_submissions))
        .route("/submissions/{id}", get(submissions::get_submission))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
