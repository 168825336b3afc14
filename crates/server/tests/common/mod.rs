//! Common test utilities for API testing with a mock executor.
//!
//! This module provides a test fixture that creates an in-process router
//! backed by a temporary SQLite database, a running scheduler and a
//! `MockExecutor`, so batches can be driven to completion over HTTP without
//! a real scoring provider.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use gradeflow_core::{
    config::{DatabaseConfig, ServerConfig},
    create_event_system,
    testing::MockExecutor,
    Config, EventStore, Executor, ExecutorBackend, ExecutorConfig, HttpExecutorConfig,
    ProgressAggregator, RetryPolicy, Scheduler, SchedulerConfig, SqliteEventStore,
    SqliteWorkStore, WorkController, WorkStore,
};
use gradeflow_server::state::AppState;

/// Test fixture for API testing.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_batch_creation() {
///     let fixture = TestFixture::new().await;
///
///     let response = fixture.post("/api/v1/batches", json!({ "name": "Essays" })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Mock executor - script outcomes, hold calls
    pub executor: Arc<MockExecutor>,
    pub scheduler: Arc<Scheduler>,
    /// Temporary directory for the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a fixture with a running scheduler.
    pub async fn new() -> Self {
        Self::with_scheduler(true).await
    }

    /// Create a fixture; `run_scheduler = false` leaves dispatch stopped.
    pub async fn with_scheduler(run_scheduler: bool) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let retry = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
        };
        let scheduler_config = SchedulerConfig {
            enabled: run_scheduler,
            tick_interval_ms: 10,
            default_max_concurrent: 2,
            ..Default::default()
        };

        let config = Config {
            executor: ExecutorConfig {
                backend: ExecutorBackend::Http,
                http: Some(HttpExecutorConfig {
                    url: "http://127.0.0.1:9/score".to_string(),
                    api_key: Some("super-secret".to_string()),
                    timeout_secs: 5,
                }),
            },
            server: ServerConfig {
                host: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                port: 0, // Not used for in-process testing
            },
            database: DatabaseConfig {
                path: db_path.clone(),
                event_buffer: 256,
            },
            scheduler: scheduler_config.clone(),
            retry,
        };

        let store: Arc<dyn WorkStore> =
            Arc::new(SqliteWorkStore::new(&db_path).expect("Failed to create work store"));
        let event_store: Arc<dyn EventStore> =
            Arc::new(SqliteEventStore::new(&db_path).expect("Failed to create event store"));

        let (event_handle, event_writer) = create_event_system(Arc::clone(&event_store), 256);
        tokio::spawn(event_writer.run());

        let executor = Arc::new(MockExecutor::new());
        let aggregator = Arc::new(ProgressAggregator::new(
            Arc::clone(&store),
            event_handle.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            scheduler_config,
            Arc::clone(&store),
            Arc::clone(&executor) as Arc<dyn Executor>,
            Arc::clone(&aggregator),
            event_handle.clone(),
        ));
        if run_scheduler {
            scheduler.start().await.expect("Failed to start scheduler");
        }

        let controller = WorkController::new(
            Arc::clone(&store),
            aggregator,
            Arc::clone(&scheduler),
            event_handle.clone(),
            retry,
        );

        let state = Arc::new(AppState::new(
            config,
            store,
            event_store,
            event_handle,
            Arc::clone(&scheduler),
            controller,
        ));

        let router = gradeflow_server::api::create_router(state);

        Self {
            router,
            executor,
            scheduler,
            temp_dir,
        }
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body (control actions).
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a request and return the raw body as text.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = match body {
            Some(json_body) => {
                request_builder = request_builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_string(&json_body).unwrap())
            }
            None => Body::empty(),
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }

    /// Create a batch holding one job with `submissions` payloads.
    /// Returns `(batch_id, job_id)`.
    pub async fn create_batch_with_job(
        &self,
        name: &str,
        priority: u8,
        submissions: usize,
    ) -> (String, String) {
        let batch = self
            .post(
                "/api/v1/batches",
                json!({ "name": name, "priority": priority }),
            )
            .await;
        assert_eq!(batch.status, StatusCode::CREATED, "{:?}", batch.body);
        let batch_id = batch.body["id"].as_str().unwrap().to_string();

        let payloads: Vec<Value> = (0..submissions)
            .map(|i| json!({ "essay": format!("essay {}", i) }))
            .collect();
        let job = self
            .post(
                "/api/v1/jobs",
                json!({
                    "batch_id": batch_id,
                    "name": format!("{} job", name),
                    "provider": "anthropic",
                    "submissions": payloads,
                }),
            )
            .await;
        assert_eq!(job.status, StatusCode::CREATED, "{:?}", job.body);
        let job_id = job.body["id"].as_str().unwrap().to_string();

        (batch_id, job_id)
    }

    /// Poll a resource until its `status` field equals `expected`.
    pub async fn wait_for_status(&self, path: &str, expected: &str) -> Value {
        for _ in 0..200 {
            let response = self.get(path).await;
            if response.body["status"] == expected {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let last = self.get(path).await;
        panic!(
            "{} never reached status {}: last body {:?}",
            path, expected, last.body
        );
    }
}
