//! API tests for the batch, job and submission endpoints.
//!
//! Each test gets its own in-process router, SQLite database and mock
//! executor (see `common::TestFixture`).

mod common;

use axum::http::StatusCode;
use common::TestFixture;
use gradeflow_core::ExecutionError;
use serde_json::json;

// =============================================================================
// Health, config and observability
// =============================================================================

#[tokio::test]
async fn test_health_reports_scheduler() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/health").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    assert_eq!(response.body["scheduler_running"], true);
}

#[tokio::test]
async fn test_config_redacts_api_key() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/config").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["executor"]["api_key_configured"], true);
    assert_eq!(response.body["executor"]["backend"], "http");
    assert!(!response.body.to_string().contains("super-secret"));
}

#[tokio::test]
async fn test_metrics_exposition() {
    let fixture = TestFixture::new().await;
    fixture.get("/api/v1/health").await;

    let (status, body) = fixture.get_text("/api/v1/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("gradeflow_http_requests_total"));
    assert!(body.contains("gradeflow_batches_by_status"));
}

#[tokio::test]
async fn test_scheduler_status_lists_lanes() {
    let fixture = TestFixture::new().await;
    let (batch_id, _) = fixture.create_batch_with_job("Lanes", 5, 2).await;
    fixture.post_empty(&format!("/api/v1/batches/{}/ready", batch_id)).await;
    fixture.post_empty(&format!("/api/v1/batches/{}/start", batch_id)).await;
    fixture
        .wait_for_status(&format!("/api/v1/batches/{}", batch_id), "completed")
        .await;

    let response = fixture.get("/api/v1/scheduler/status").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["running"], true);
    let lanes = response.body["lanes"].as_array().unwrap();
    assert_eq!(lanes.len(), 1);
    assert_eq!(lanes[0]["provider"], "anthropic");
    assert_eq!(lanes[0]["max_concurrent"], 2);
}

// =============================================================================
// Creation and validation
// =============================================================================

#[tokio::test]
async fn test_create_batch_defaults() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post("/api/v1/batches", json!({ "name": "Week 3 essays" }))
        .await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["status"], "draft");
    assert_eq!(response.body["priority"], 5);
    assert_eq!(response.body["total_jobs"], 0);
}

#[tokio::test]
async fn test_create_batch_rejects_bad_priority() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post("/api/v1/batches", json!({ "name": "Too urgent", "priority": 11 }))
        .await;

    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.body["code"], "validation");
}

#[tokio::test]
async fn test_create_job_in_unknown_batch() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post(
            "/api/v1/jobs",
            json!({ "batch_id": "missing", "name": "Orphan", "provider": "anthropic" }),
        )
        .await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.body["code"], "not_found");
}

#[tokio::test]
async fn test_get_unknown_batch() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/api/v1/batches/nope").await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(response.body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_add_submission_updates_totals() {
    let fixture = TestFixture::new().await;
    let (batch_id, job_id) = fixture.create_batch_with_job("Growing", 5, 1).await;

    let response = fixture
        .post(
            &format!("/api/v1/jobs/{}/submissions", job_id),
            json!({ "payload": { "essay": "late entry" } }),
        )
        .await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["status"], "queued");
    assert_eq!(response.body["attempt_count"], 0);

    let job = fixture.get(&format!("/api/v1/jobs/{}", job_id)).await;
    assert_eq!(job.body["total_submissions"], 2);
    let batch = fixture.get(&format!("/api/v1/batches/{}", batch_id)).await;
    assert_eq!(batch.body["total_jobs"], 1);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_batch_runs_to_completion() {
    let fixture = TestFixture::new().await;
    let (batch_id, job_id) = fixture.create_batch_with_job("Happy path", 5, 3).await;

    let ready = fixture
        .post_empty(&format!("/api/v1/batches/{}/ready", batch_id))
        .await;
    assert_eq!(ready.status, StatusCode::OK);
    assert_eq!(ready.body["status"], "pending");

    let started = fixture
        .post_empty(&format!("/api/v1/batches/{}/start", batch_id))
        .await;
    assert_eq!(started.status, StatusCode::OK);

    let batch = fixture
        .wait_for_status(&format!("/api/v1/batches/{}", batch_id), "completed")
        .await;
    assert_eq!(batch["completed_jobs"], 1);

    let submissions = fixture
        .get(&format!(
            "/api/v1/submissions?job_id={}&status=completed",
            job_id
        ))
        .await;
    assert_eq!(submissions.status, StatusCode::OK);
    assert_eq!(submissions.body["total"], 3);

    let analytics = fixture
        .get(&format!("/api/v1/batches/{}/analytics", batch_id))
        .await;
    assert_eq!(analytics.status, StatusCode::OK);
    assert_eq!(analytics.body["total_submissions"], 3);
    assert_eq!(analytics.body["success_rate"], 100.0);
    assert_eq!(analytics.body["providers"][0]["provider"], "anthropic");
}

#[tokio::test]
async fn test_start_draft_batch_is_conflict() {
    let fixture = TestFixture::new().await;
    let (batch_id, _) = fixture.create_batch_with_job("Not ready", 5, 1).await;

    let response = fixture
        .post_empty(&format!("/api/v1/batches/{}/start", batch_id))
        .await;

    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.body["code"], "invalid_transition");
}

#[tokio::test]
async fn test_start_without_submissions_has_no_eligible_work() {
    let fixture = TestFixture::new().await;
    let (batch_id, _) = fixture.create_batch_with_job("Empty", 5, 0).await;
    fixture
        .post_empty(&format!("/api/v1/batches/{}/ready", batch_id))
        .await;

    let response = fixture
        .post_empty(&format!("/api/v1/batches/{}/start", batch_id))
        .await;

    assert_eq!(response.status, StatusCode::CONFLICT);
    assert_eq!(response.body["code"], "no_eligible_work");
}

#[tokio::test]
async fn test_pause_and_resume() {
    let fixture = TestFixture::new().await;
    let (batch_id, job_id) = fixture.create_batch_with_job("Pausable", 5, 4).await;
    fixture
        .post_empty(&format!("/api/v1/batches/{}/ready", batch_id))
        .await;

    fixture.executor.hold();
    fixture
        .post_empty(&format!("/api/v1/batches/{}/start", batch_id))
        .await;

    let paused = fixture
        .post_empty(&format!("/api/v1/batches/{}/pause", batch_id))
        .await;
    assert_eq!(paused.status, StatusCode::OK);
    assert_eq!(paused.body["status"], "paused");

    let job = fixture.get(&format!("/api/v1/jobs/{}", job_id)).await;
    assert_eq!(job.body["status"], "paused");

    // Pausing twice is rejected
    let again = fixture
        .post_empty(&format!("/api/v1/batches/{}/pause", batch_id))
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);

    let resumed = fixture
        .post_empty(&format!("/api/v1/batches/{}/resume", batch_id))
        .await;
    assert_eq!(resumed.status, StatusCode::OK);
    assert_eq!(resumed.body["status"], "processing");

    fixture.executor.release();
    fixture
        .wait_for_status(&format!("/api/v1/batches/{}", batch_id), "completed")
        .await;
}

#[tokio::test]
async fn test_cancel_batch() {
    let fixture = TestFixture::new().await;
    let (batch_id, job_id) = fixture.create_batch_with_job("Doomed", 5, 3).await;
    fixture
        .post_empty(&format!("/api/v1/batches/{}/ready", batch_id))
        .await;

    fixture.executor.hold();
    fixture
        .post_empty(&format!("/api/v1/batches/{}/start", batch_id))
        .await;

    let cancelled = fixture
        .post_empty(&format!("/api/v1/batches/{}/cancel", batch_id))
        .await;
    assert_eq!(cancelled.status, StatusCode::OK);
    assert_eq!(cancelled.body["status"], "cancelled");
    fixture.executor.release();

    let open = fixture
        .get(&format!(
            "/api/v1/submissions?job_id={}&status=queued",
            job_id
        ))
        .await;
    assert_eq!(open.body["total"], 0);

    let archived = fixture
        .post_empty(&format!("/api/v1/batches/{}/archive", batch_id))
        .await;
    assert_eq!(archived.status, StatusCode::OK);
    assert_eq!(archived.body["status"], "archived");
}

#[tokio::test]
async fn test_retry_failed_over_http() {
    let fixture = TestFixture::new().await;
    let (batch_id, job_id) = fixture.create_batch_with_job("Flaky", 5, 2).await;

    let submissions = fixture
        .get(&format!("/api/v1/submissions?job_id={}", job_id))
        .await;
    let failing_id = submissions.body["items"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();
    fixture
        .executor
        .script(
            &failing_id,
            vec![Err(ExecutionError::permanent("rubric missing"))],
        )
        .await;

    fixture
        .post_empty(&format!("/api/v1/batches/{}/ready", batch_id))
        .await;
    fixture
        .post_empty(&format!("/api/v1/batches/{}/start", batch_id))
        .await;

    let batch = fixture
        .wait_for_status(
            &format!("/api/v1/batches/{}", batch_id),
            "completed_with_errors",
        )
        .await;
    assert_eq!(batch["completed_jobs"], 1);

    let failed = fixture
        .get(&format!("/api/v1/submissions/{}", failing_id))
        .await;
    assert_eq!(failed.body["status"], "failed");
    assert_eq!(failed.body["last_error"]["kind"], "permanent");

    let retried = fixture
        .post_empty(&format!("/api/v1/batches/{}/retry-failed", batch_id))
        .await;
    assert_eq!(retried.status, StatusCode::OK);

    fixture
        .wait_for_status(&format!("/api/v1/batches/{}", batch_id), "completed")
        .await;

    // Nothing left to retry
    let again = fixture
        .post_empty(&format!("/api/v1/batches/{}/retry-failed", batch_id))
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_duplicate_batch() {
    let fixture = TestFixture::new().await;
    let (batch_id, _) = fixture.create_batch_with_job("Template", 7, 2).await;

    let copy = fixture
        .post_empty(&format!("/api/v1/batches/{}/duplicate", batch_id))
        .await;

    assert_eq!(copy.status, StatusCode::CREATED);
    assert_ne!(copy.body["id"], batch_id.as_str());
    assert_eq!(copy.body["status"], "draft");
    assert_eq!(copy.body["priority"], 7);
    assert_eq!(copy.body["name"], "Template (copy)");

    let copy_id = copy.body["id"].as_str().unwrap();
    let jobs = fixture
        .get(&format!("/api/v1/jobs?batch_id={}", copy_id))
        .await;
    assert_eq!(jobs.body["total"], 1);
    assert_eq!(jobs.body["items"][0]["total_submissions"], 2);
}

#[tokio::test]
async fn test_jobs_cannot_be_archived() {
    let fixture = TestFixture::new().await;
    let (_, job_id) = fixture.create_batch_with_job("Archive", 5, 1).await;

    let response = fixture
        .post_empty(&format!("/api/v1/jobs/{}/archive", job_id))
        .await;

    assert_eq!(response.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_standalone_job_lifecycle() {
    let fixture = TestFixture::new().await;

    let job = fixture
        .post(
            "/api/v1/jobs",
            json!({
                "name": "Quick check",
                "provider": "openai",
                "priority": 9,
                "submissions": [{ "essay": "a" }, { "essay": "b" }],
            }),
        )
        .await;
    assert_eq!(job.status, StatusCode::CREATED);
    assert!(job.body["batch_id"].is_null());
    let job_id = job.body["id"].as_str().unwrap().to_string();

    fixture
        .post_empty(&format!("/api/v1/jobs/{}/ready", job_id))
        .await;
    let started = fixture
        .post_empty(&format!("/api/v1/jobs/{}/start", job_id))
        .await;
    assert_eq!(started.status, StatusCode::OK);

    let done = fixture
        .wait_for_status(&format!("/api/v1/jobs/{}", job_id), "completed")
        .await;
    assert_eq!(done["completed_submissions"], 2);
}

// =============================================================================
// Listing and events
// =============================================================================

#[tokio::test]
async fn test_list_batches_filters_and_pages() {
    let fixture = TestFixture::new().await;
    for i in 0..3 {
        fixture
            .post(
                "/api/v1/batches",
                json!({ "name": format!("Batch {}", i), "priority": 3 + i }),
            )
            .await;
    }

    let page = fixture.get("/api/v1/batches?limit=2").await;
    assert_eq!(page.status, StatusCode::OK);
    assert_eq!(page.body["total"], 3);
    assert_eq!(page.body["limit"], 2);
    assert_eq!(page.body["items"].as_array().unwrap().len(), 2);

    let urgent = fixture.get("/api/v1/batches?min_priority=5").await;
    assert_eq!(urgent.body["total"], 1);

    let drafts = fixture.get("/api/v1/batches?status=draft").await;
    assert_eq!(drafts.body["total"], 3);

    let bad = fixture.get("/api/v1/batches?status=sleeping").await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_jobs_by_priority() {
    let fixture = TestFixture::with_scheduler(false).await;
    let (_, inherited_id) = fixture.create_batch_with_job("Homework", 3, 1).await;
    let urgent = fixture
        .post(
            "/api/v1/jobs",
            json!({ "name": "Resubmits", "provider": "openai", "priority": 9 }),
        )
        .await;
    let urgent_id = urgent.body["id"].as_str().unwrap().to_string();

    let high = fixture.get("/api/v1/jobs?min_priority=5").await;
    assert_eq!(high.status, StatusCode::OK);
    assert_eq!(high.body["total"], 1);
    assert_eq!(high.body["items"][0]["id"], urgent_id.as_str());

    let low = fixture.get("/api/v1/jobs?max_priority=4").await;
    assert_eq!(low.body["total"], 1);
    assert_eq!(low.body["items"][0]["id"], inherited_id.as_str());
}

#[tokio::test]
async fn test_event_log_records_creation() {
    let fixture = TestFixture::new().await;
    let created = fixture
        .post("/api/v1/batches", json!({ "name": "Audited" }))
        .await;
    let batch_id = created.body["id"].as_str().unwrap().to_string();

    // The event writer persists asynchronously
    let mut total = 0;
    for _ in 0..100 {
        let events = fixture
            .get(&format!(
                "/api/v1/events?subject=batch&entity_id={}&event_type=batch_created",
                batch_id
            ))
            .await;
        assert_eq!(events.status, StatusCode::OK);
        total = events.body["total"].as_i64().unwrap();
        if total > 0 {
            assert_eq!(events.body["items"][0]["data"]["name"], "Audited");
            assert_eq!(events.body["items"][0]["subject"], "batch");
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(total, 1);

    let bad = fixture.get("/api/v1/events?subject=ticket").await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
}
