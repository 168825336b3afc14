use super::{types::Config, ConfigError};
use crate::executor::ExecutorBackend;

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Scheduler tick interval and every lane capacity are non-zero
/// - Retry base delay does not exceed the max delay
/// - The HTTP executor has a URL
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let scheduler = &config.scheduler;
    if scheduler.tick_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "scheduler.tick_interval_ms cannot be 0".to_string(),
        ));
    }
    if scheduler.default_max_concurrent == 0 {
        return Err(ConfigError::ValidationError(
            "scheduler.default_max_concurrent cannot be 0".to_string(),
        ));
    }
    for (provider, lane) in &scheduler.providers {
        if lane.max_concurrent == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "scheduler.providers.{}.max_concurrent cannot be 0",
                provider
            )));
        }
    }

    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(ConfigError::ValidationError(format!(
            "retry.base_delay_ms ({}) cannot exceed retry.max_delay_ms ({})",
            config.retry.base_delay_ms, config.retry.max_delay_ms
        )));
    }

    match config.executor.backend {
        ExecutorBackend::Http => match config.executor.http {
            Some(ref http) if !http.url.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::ValidationError(
                    "executor.http.url is required when backend = \"http\"".to_string(),
                ));
            }
        },
    }

    Ok(())
}
