//! Executor configuration.

use serde::{Deserialize, Serialize};

/// Which execution backend the server wires in.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorBackend {
    Http,
}

/// Executor configuration section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub backend: ExecutorBackend,
    /// Required when backend = "http".
    #[serde(default)]
    pub http: Option<HttpExecutorConfig>,
}

/// HTTP scoring endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpExecutorConfig {
    /// Endpoint receiving one POST per submission.
    pub url: String,
    /// Bearer token sent with every call.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds (default: 60).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    60
}
