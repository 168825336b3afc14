use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::executor::{ExecutorBackend, ExecutorConfig};
use crate::retry::RetryPolicy;
use crate::scheduler::{LaneConfig, SchedulerConfig};

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Default retry policy for jobs created without one.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Buffer between event producers and the event log writer.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("gradeflow.db")
}

fn default_event_buffer() -> usize {
    1024
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub executor: SanitizedExecutorConfig,
}

/// Sanitized executor config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedExecutorConfig {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub api_key_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        let http = config.executor.http.as_ref();
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            scheduler: config.scheduler.clone(),
            retry: config.retry,
            executor: SanitizedExecutorConfig {
                backend: match config.executor.backend {
                    ExecutorBackend::Http => "http".to_string(),
                },
                url: http.map(|h| h.url.clone()),
                api_key_configured: http
                    .and_then(|h| h.api_key.as_ref())
                    .is_some_and(|k| !k.is_empty()),
                timeout_secs: http.map(|h| h.timeout_secs),
            },
        }
    }
}

impl Config {
    /// Lane overrides keyed by provider name.
    pub fn providers(&self) -> &BTreeMap<String, LaneConfig> {
        &self.scheduler.providers
    }
}
