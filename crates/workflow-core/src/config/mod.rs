use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{DefaultsConfig, DiscoveryConfig, EngineConfig, LimitsConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate an `EngineConfig` from a TOML file path, then apply
/// `WORKFLOW_ENGINE_*` environment overrides (§6).
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let mut config = if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        EngineConfig::default()
    } else {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        parse_config(&data)?
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Parse and validate an `EngineConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut EngineConfig) {
    if let Ok(dir) = std::env::var("WORKFLOW_ENGINE_PROJECT_DIR") {
        config.discovery.project_dir = Some(dir);
    }
    if let Ok(dir) = std::env::var("WORKFLOW_ENGINE_HOME_DIR") {
        config.discovery.home_dir = Some(dir);
    }
    if std::env::var("WORKFLOW_ENGINE_DEBUG").is_ok_and(|v| v == "1" || v == "true") {
        config.debug = true;
    }
    if let Ok(v) = std::env::var("WORKFLOW_ENGINE_MAX_CONCURRENT_WORKFLOWS") {
        if let Ok(n) = v.parse() {
            config.limits.max_concurrent_workflows = n;
        }
    }
    if let Ok(v) = std::env::var("WORKFLOW_ENGINE_MAX_STATE_BYTES") {
        if let Ok(n) = v.parse() {
            config.limits.max_state_bytes = n;
        }
    }
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.limits.max_state_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "limits.max_state_bytes must be > 0".to_string(),
        });
    }

    if config.limits.max_concurrent_workflows == 0 {
        return Err(ConfigError::Validation {
            message: "limits.max_concurrent_workflows must be > 0".to_string(),
        });
    }

    if config.defaults.max_iterations == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.max_iterations must be > 0".to_string(),
        });
    }

    if config.defaults.step_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.step_timeout_seconds must be > 0".to_string(),
        });
    }

    if config.defaults.workflow_timeout_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.workflow_timeout_seconds must be > 0".to_string(),
        });
    }

    if config.defaults.max_parallel == 0 {
        return Err(ConfigError::Validation {
            message: "defaults.max_parallel must be > 0".to_string(),
        });
    }

    if config.defaults.retry_backoff_multiplier < 1.0
        || !config.defaults.retry_backoff_multiplier.is_finite()
    {
        return Err(ConfigError::Validation {
            message: "defaults.retry_backoff_multiplier must be a finite number >= 1.0"
                .to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = EngineConfig::default();
        validate(&config).unwrap();
    }

    #[test]
    fn minimal_toml_parses_to_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.defaults.max_iterations, 100);
        assert_eq!(config.defaults.max_parallel, 10);
        assert!(!config.debug);
    }

    #[test]
    fn full_example_config_parses() {
        let data = r#"
debug = true

[discovery]
project_dir = "/repo/.aromcp/workflows"
home_dir = "/home/user/.aromcp/workflows"

[limits]
max_state_bytes = 1048576
max_concurrent_workflows = 8

[defaults]
max_iterations = 50
step_timeout_seconds = 60
workflow_timeout_seconds = 600
max_parallel = 4
retry_backoff_base_ms = 100
retry_backoff_multiplier = 1.5
retry_backoff_cap_ms = 5000
"#;
        let config = parse_config(data).unwrap();
        assert!(config.debug);
        assert_eq!(
            config.discovery.project_dir.as_deref(),
            Some("/repo/.aromcp/workflows")
        );
        assert_eq!(config.limits.max_state_bytes, 1_048_576);
        assert_eq!(config.limits.max_concurrent_workflows, 8);
        assert_eq!(config.defaults.max_iterations, 50);
        assert_eq!(config.defaults.max_parallel, 4);
    }

    #[test]
    fn zero_max_state_bytes_rejected() {
        let data = "[limits]\nmax_state_bytes = 0\n";
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("max_state_bytes"));
    }

    #[test]
    fn zero_max_iterations_rejected() {
        let data = "[defaults]\nmax_iterations = 0\n";
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn backoff_multiplier_below_one_rejected() {
        let data = "[defaults]\nretry_backoff_multiplier = 0.5\n";
        let err = parse_config(data).unwrap_err();
        assert!(err.to_string().contains("retry_backoff_multiplier"));
    }

    #[test]
    fn unknown_field_in_toml_returns_parse_error() {
        let data = "nonexistent_field = \"bad\"\n";
        let err = parse_config(data).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = load_config(Path::new("/tmp/nonexistent-workflow-engine-test.toml")).unwrap();
        assert_eq!(config.defaults, DefaultsConfig::default());
    }
}
