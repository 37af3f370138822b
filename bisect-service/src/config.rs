// Engine Configuration
// Backend endpoints, bisection thresholds and tick settings loaded from YAML

use crate::quest::DEFAULT_MAX_POLLS;
use crate::services::http::HttpEndpoints;
use crate::task::DEFAULT_MAX_PASSES;

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// What a failed build/test/read task does to its job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AncillaryFailurePolicy {
    /// Keep the failure in the task payload; the job continues
    #[default]
    Record,
    /// Any failed task fails the job
    FailJob,
}

/// Thresholds driving the find-culprit comparisons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BisectionSettings {
    /// Attempts started for every new change
    pub min_attempts: usize,

    /// Ceiling when refining inconclusive comparisons
    pub max_attempts: usize,

    /// p-value at or below which two changes differ
    pub significance: f64,

    /// p-value at or below which a comparison is inconclusive
    pub inconclusive_level: f64,

    pub ancillary_failures: AncillaryFailurePolicy,
}

impl Default for BisectionSettings {
    fn default() -> Self {
        Self {
            min_attempts: 10,
            max_attempts: 100,
            significance: 0.05,
            inconclusive_level: 0.1,
            ancillary_failures: AncillaryFailurePolicy::Record,
        }
    }
}

/// Settings of the recurring engine tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub tick_interval_ms: u64,

    /// Traversals per job evaluation
    pub max_passes: usize,

    /// Polls before an execution times out
    pub max_polls: u32,

    /// Jobs of one configuration that may run at the same time
    pub max_running_per_configuration: usize,

    /// Stop `Engine::run` after this many ticks
    pub max_ticks: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_passes: DEFAULT_MAX_PASSES,
            max_polls: DEFAULT_MAX_POLLS,
            max_running_per_configuration: 1,
            max_ticks: None,
        }
    }
}

/// Configuration for the bisection engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub services: HttpEndpoints,
    pub bisection: BisectionSettings,
    pub engine: EngineSettings,
}

impl EngineConfig {
    /// Default config location (~/.bisect/config.yaml)
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bisect")
            .join("config.yaml")
    }

    /// Parse a YAML config string
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Load and validate a config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, otherwise the default location, otherwise defaults.
    ///
    /// An explicitly given file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(path)
                } else {
                    debug!(path = %path.display(), "no config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bisection = &self.bisection;
        if bisection.min_attempts == 0 {
            return Err(invalid("bisection.min_attempts", "must be at least 1"));
        }
        if bisection.max_attempts < bisection.min_attempts {
            return Err(invalid(
                "bisection.max_attempts",
                "must not be below min_attempts",
            ));
        }
        if !(0.0..=1.0).contains(&bisection.significance) {
            return Err(invalid("bisection.significance", "must be within [0, 1]"));
        }
        if !(bisection.significance..=1.0).contains(&bisection.inconclusive_level) {
            return Err(invalid(
                "bisection.inconclusive_level",
                "must be within [significance, 1]",
            ));
        }
        if self.engine.max_passes == 0 {
            return Err(invalid("engine.max_passes", "must be at least 1"));
        }
        if self.engine.max_polls == 0 {
            return Err(invalid("engine.max_polls", "must be at least 1"));
        }
        if self.engine.max_running_per_configuration == 0 {
            return Err(invalid(
                "engine.max_running_per_configuration",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
