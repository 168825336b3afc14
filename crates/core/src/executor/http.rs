//! HTTP scoring endpoint executor.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::config::HttpExecutorConfig;
use super::error::ExecutionError;
use super::traits::{ExecutionOutput, ExecutionRequest, Executor};

/// Body returned by the scoring endpoint.
#[derive(Debug, Deserialize)]
struct ScoreResponse {
    output: String,
}

/// Executor that POSTs each request as JSON to a configured endpoint.
pub struct HttpExecutor {
    client: Client,
    config: HttpExecutorConfig,
}

impl HttpExecutor {
    /// Create a new HttpExecutor with the given configuration.
    pub fn new(config: HttpExecutorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }
}

/// Statuses worth retrying: rate limiting, request timeout, server errors.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        debug!(
            submission_id = %request.submission_id,
            provider = %request.provider,
            attempt = request.attempt,
            "Calling scoring endpoint"
        );

        let mut builder = self.client.post(&self.config.url).json(request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::transient(format!("request timed out: {}", e))
            } else if e.is_connect() {
                ExecutionError::transient(format!("connection failed: {}", e))
            } else {
                ExecutionError::transient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            );
            return Err(if is_transient_status(status) {
                ExecutionError::Transient(message)
            } else {
                ExecutionError::Permanent(message)
            });
        }

        let parsed: ScoreResponse = response.json().await.map_err(|e| {
            ExecutionError::permanent(format!("Failed to parse response: {}", e))
        })?;

        Ok(ExecutionOutput::new(parsed.output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let executor = HttpExecutor::new(HttpExecutorConfig {
            url: "http://127.0.0.1:1/score".to_string(),
            api_key: None,
            timeout_secs: 2,
        })
        .unwrap();

        let request = ExecutionRequest {
            submission_id: "s1".to_string(),
            job_id: "j1".to_string(),
            provider: "openai".to_string(),
            attempt: 0,
            payload: serde_json::json!({"document": "essay.pdf"}),
        };

        let err = executor.execute(&request).await.unwrap_err();
        assert_eq!(err.kind(), super::super::ErrorKind::Transient);
    }
}
