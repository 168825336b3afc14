//! Layered configuration: a TOML file overridden by `GRADEFLOW_*` variables.

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

use super::{types::Config, ConfigError};

const ENV_PREFIX: &str = "GRADEFLOW_";

/// Separates nested keys in variable names.
const ENV_NESTING: &str = "__";

/// Load configuration from `path` with environment overrides.
///
/// `GRADEFLOW_SCHEDULER__DEFAULT_MAX_CONCURRENT=8` overrides
/// `scheduler.default_max_concurrent`, and
/// `GRADEFLOW_SCHEDULER__PROVIDERS__OPENAI__MAX_CONCURRENT=2` sets one lane.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    extract(with_env_overrides(Figment::from(Toml::file(path)), ENV_PREFIX))
}

/// Parse a TOML document without environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn with_env_overrides(figment: Figment, prefix: &str) -> Figment {
    figment.merge(Env::prefixed(prefix).split(ENV_NESTING))
}

/// Extract, reporting every problem figment found rather than the first.
fn extract(figment: Figment) -> Result<Config, ConfigError> {
    figment.extract().map_err(|err| {
        let problems: Vec<String> = err.into_iter().map(|e| e.to_string()).collect();
        ConfigError::ParseError(problems.join("; "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCORING_SERVICE: &str = r#"
[executor]
backend = "http"

[executor.http]
url = "http://localhost:9000/score"

[scheduler.providers.anthropic]
max_concurrent = 2
"#;

    #[test]
    fn test_missing_executor_is_named() {
        let err = load_config_from_str("[server]\nport = 8080\n").unwrap_err();
        match err {
            ConfigError::ParseError(message) => assert!(message.contains("executor")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/gradeflow.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_file_sets_lanes() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", SCORING_SERVICE).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.scheduler.lane("anthropic").max_concurrent, 2);
        assert_eq!(
            config.executor.http.map(|http| http.url),
            Some("http://localhost:9000/score".to_string())
        );
    }

    #[test]
    fn test_environment_overrides_nested_keys() {
        // Prefix unique to this test so parallel tests never see it.
        let prefix = "GRADEFLOW_LOADER_TEST_";
        std::env::set_var(format!("{}SCHEDULER__PROVIDERS__ANTHROPIC__MAX_CONCURRENT", prefix), "7");
        std::env::set_var(format!("{}RETRY__MAX_RETRIES", prefix), "1");

        let figment = with_env_overrides(Figment::from(Toml::string(SCORING_SERVICE)), prefix);
        let config = extract(figment).unwrap();

        std::env::remove_var(format!("{}SCHEDULER__PROVIDERS__ANTHROPIC__MAX_CONCURRENT", prefix));
        std::env::remove_var(format!("{}RETRY__MAX_RETRIES", prefix));

        assert_eq!(config.scheduler.lane("anthropic").max_concurrent, 7);
        assert_eq!(config.retry.max_retries, 1);
    }

    #[test]
    fn test_extract_reports_bad_values() {
        let figment = Figment::from(Toml::string(SCORING_SERVICE))
            .merge(Toml::string("[retry]\nmax_retries = \"many\"\n"));
        let err = extract(figment).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(ref m) if m.contains("max_retries")));
    }
}
