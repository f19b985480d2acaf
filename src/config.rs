//! Configuration System
//!
//! Hierarchical engine configuration: built-in defaults, a user-level file, workspace files and
//! `DRAFTBENCH__*` environment overrides, validated as a whole before the engine starts.

use crate::agent::AgentLimits;
use crate::checkpoint::RetentionPolicy;
use crate::consent::EgressPolicy;
use crate::logging::LoggingConfig;
use crate::retry::RetryPolicy;
use crate::snapshot::SnapshotConfig;
use crate::store::FileLimits;
use crate::toolworker::ToolWorkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub use crate::provider::ProviderConfig;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one subdirectory per workbench
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workbenches_dir: Option<PathBuf>,

    #[serde(default)]
    pub limits: FileLimits,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub checkpoints: RetentionPolicy,

    #[serde(default)]
    pub agent: AgentLimits,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub egress: EgressPolicy,

    /// Model provider configurations keyed by provider id
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub tool_worker: ToolWorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Provider(String, String),
    Agent(String),
    System(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(name, msg) => write!(f, "Provider '{}': {}", name, msg),
            ValidationError::Agent(msg) => write!(f, "Agent: {}", msg),
            ValidationError::System(msg) => write!(f, "System: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl EngineConfig {
    /// Workbenches directory, falling back to the platform data directory.
    pub fn resolved_workbenches_dir(&self) -> PathBuf {
        if let Some(dir) = &self.workbenches_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "draftbench", "draftbench")
            .map(|dirs| dirs.data_dir().join("workbenches"))
            .unwrap_or_else(|| PathBuf::from(".draftbench").join("workbenches"))
    }

    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (name, provider) in &self.providers {
            if let Err(e) = provider.validate() {
                errors.push(ValidationError::Provider(name.clone(), e));
            }
        }

        if let Err(e) = self.agent.validate() {
            errors.push(ValidationError::Agent(e));
        }

        if self.limits.max_files == 0 {
            errors.push(ValidationError::System(
                "limits.max_files must be at least 1".to_string(),
            ));
        }
        if self.limits.max_file_size == 0 {
            errors.push(ValidationError::System(
                "limits.max_file_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            errors.push(ValidationError::System(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push(ValidationError::System(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        if self.tool_worker.call_timeout_ms == 0 {
            errors.push(ValidationError::System(
                "tool_worker.call_timeout_ms must be positive".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, crate::error::ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::error::ConfigError::Invalid(format!("Failed to render: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.providers.is_empty());
        assert_eq!(config.limits.max_files, 10);
        assert_eq!(config.limits.max_file_size, 25 * 1024 * 1024);
        assert_eq!(config.checkpoints.max_auto, 200);
        assert_eq!(config.checkpoints.max_manual, 50);
        assert_eq!(config.agent.max_tool_calls_per_turn, 50);
        assert_eq!(config.agent.max_round_trips, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = EngineConfig::default();
        config.limits.max_files = 0;
        config.retry.max_attempts = 0;
        config.providers.insert(
            "broken".to_string(),
            ProviderConfig {
                model: String::new(),
                base_url: None,
                api_key_env: None,
            },
        );
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_load_from_toml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("engine.toml");
        std::fs::write(
            &config_file,
            r#"
workbenches_dir = "/srv/workbenches"

[agent]
max_round_trips = 12

[checkpoints]
max_manual = 5

[providers.openai]
model = "gpt-4o"
api_key_env = "OPENAI_API_KEY"
"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&config_file).unwrap();
        assert_eq!(
            config.resolved_workbenches_dir(),
            PathBuf::from("/srv/workbenches")
        );
        assert_eq!(config.agent.max_round_trips, 12);
        assert_eq!(config.agent.max_tool_calls_per_turn, 50);
        assert_eq!(config.checkpoints.max_manual, 5);
        assert_eq!(config.checkpoints.max_auto, 200);
        assert_eq!(config.providers["openai"].model, "gpt-4o");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(ConfigLoader::load_from_file(&temp_dir.path().join("nope.toml")).is_err());
    }

    #[test]
    fn test_renders_toml() {
        let rendered = EngineConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("[limits]"));
        assert!(rendered.contains("max_files = 10"));
    }
}
