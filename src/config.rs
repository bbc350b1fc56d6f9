//! Engine configuration.
//!
//! Loaded from an optional file plus `POLICY_ENGINE__*` environment
//! variables, e.g. `POLICY_ENGINE__LOGGING__LEVEL=debug` or
//! `POLICY_ENGINE__EVALUATION__DEFAULT_STRATEGY_OVERRIDE=exhaustive`.

use crate::policy::Strategy;
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "POLICY_ENGINE";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logging
    pub logging: LoggingConfig,
    /// Evaluation counters
    pub telemetry: TelemetryConfig,
    /// Evaluation defaults
    pub evaluation: EvaluationConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `policy_engine=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Record evaluation counters
    pub enabled: bool,
    /// Service name attached to the evaluation span
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "policy-engine".to_string(),
        }
    }
}

/// Evaluation configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Strategy forced on every policy, overriding its default
    pub default_strategy_override: Option<Strategy>,
}

impl EngineConfig {
    /// Load from environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::load(None::<&Path>)
    }

    /// Load from an optional file, then environment variables on top.
    pub fn load(path: Option<impl AsRef<Path>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.as_ref()).required(true));
        }
        let config: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.logging.level.trim().is_empty() {
            return Err(Error::config_key(
                "Log level cannot be empty",
                "logging.level",
            ));
        }
        if self.telemetry.enabled && self.telemetry.service_name.trim().is_empty() {
            return Err(Error::config_key(
                "Service name cannot be empty when telemetry is enabled",
                "telemetry.service_name",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.telemetry.enabled);
        assert_eq!(config.evaluation.default_strategy_override, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.telemetry.service_name = String::new();
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        config.telemetry.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("policy-engine-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"logging": {{"level": "debug", "json": true}}, "evaluation": {{"default_strategy_override": "exhaustive"}}}}"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(
            config.evaluation.default_strategy_override,
            Some(Strategy::Exhaustive)
        );
        assert_eq!(config.telemetry.service_name, "policy-engine");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(EngineConfig::load(Some("/nonexistent/engine.toml")).is_err());
    }
}
