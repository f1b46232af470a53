//! Configuration Management
//!
//! Loads and manages application configuration using config-rs.
//! Follows XDG specification for config file locations.

use crate::error::ConfigResult;
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Runner settings
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Program driven by the console ("terraform", "tofu", "terragrunt")
    #[serde(default = "default_program")]
    pub program: String,

    /// Directory for collaborator artefacts such as plan files
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Maximum number of concurrently running tasks
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps in log output
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include file and line number in log output
    #[serde(default)]
    pub file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            file_line: false,
        }
    }
}

fn default_program() -> String {
    "terraform".to_string()
}

fn default_max_parallelism() -> usize {
    2 * num_cpus::get()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from the XDG config file, then apply
    /// environment overrides with an `OPSDECK_` prefix.
    pub fn load() -> ConfigResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = Self::config_file() {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("OPSDECK").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Default config file location (e.g. `~/.config/opsdeck/config.toml`).
    #[must_use]
    pub fn config_file() -> Option<PathBuf> {
        ProjectDirs::from("", "", "opsdeck").map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
