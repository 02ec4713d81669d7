//! # Configuration
//!
//! Tool location, job behaviour and default processing options, loaded from TOML.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [tool]
//! program = "magick"
//! directory = "/opt/ImageMagick/bin"
//!
//! [job]
//! poll_interval_ms = 100
//!
//! [options]
//! negate = true
//! threshold = true
//! threshold_percent = 50.0
//! ```
//!
//! ## Example: Rust Usage
//!
//! ```rust
//! use cws_stack::config::Config;
//! let toml_str = r#"
//! [tool]
//! program = "convert-im7"
//!
//! [options]
//! negate = true
//! "#;
//! let config: Config = toml::from_str(toml_str).unwrap();
//! assert_eq!(config.tool.program, "convert-im7");
//! assert!(config.options.negate);
//! assert_eq!(config.job.poll_interval_ms, 100);
//! assert!(config.validate().is_ok());
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::request::ProcessingOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration handed to the job controller and comparison engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub options: ProcessingOptions,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("job.poll_interval_ms must be greater than zero".to_string()));
        }
        self.options
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("options: {}", e)))?;
        Ok(())
    }
}

/// Where to find the external raster tool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Install folder override; when unset the program is looked up on PATH.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            directory: None,
        }
    }
}

impl ToolConfig {
    pub fn executable(&self) -> PathBuf {
        match &self.directory {
            Some(dir) => dir.join(&self.program),
            None => PathBuf::from(&self.program),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Parent directory for scratch directories; the system temp dir when unset.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            scratch_dir: None,
        }
    }
}

impl JobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Fresh scratch directory, removed when the returned handle is dropped.
    pub fn scratch(&self, prefix: &str) -> std::io::Result<tempfile::TempDir> {
        scratch_in(self.scratch_dir.as_deref(), prefix)
    }
}

/// New temporary directory under `parent`, or the system temp dir.
pub fn scratch_in(parent: Option<&Path>, prefix: &str) -> std::io::Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match parent {
        Some(dir) => builder.tempdir_in(dir),
        None => builder.tempdir(),
    }
}

fn default_program() -> String {
    "magick".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    load_config_path(Path::new(path))
}

pub fn load_config_path(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
