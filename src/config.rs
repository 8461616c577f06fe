//! Config loading and persistence.
//!
//! The enclosing service hands the pool a [`Config`] loaded from a TOML
//! file. Missing or unparsable configuration falls back to defaults with
//! a warning; writes are atomic.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pool: PoolSettings,
    pub logging: LoggingConfig,
}

/// Pool-level tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Global capacity: maximum number of worker processes across all
    /// groups.
    pub max: usize,
    /// Idle time after which a worker becomes a reaping candidate, in
    /// seconds.
    pub max_idle_time_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max: 6,
            max_idle_time_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::default(),
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    /// Log directory; `None` means the enclosing service's default.
    pub dir: Option<std::path::PathBuf>,
    pub format: LogFormat,
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Load the config, or initialize the file with defaults. Errors never
/// propagate: a broken config file means defaults plus a warning.
pub fn load_or_init(path: &Path) -> Config {
    if path.exists() {
        match load(path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }
    let cfg = Config::default();
    if let Err(e) = write_config(path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.display().to_string(),
        reason,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| write_err(e.to_string()))?;
    }
    let contents = toml::to_string_pretty(cfg).map_err(|e| write_err(e.to_string()))?;
    atomic_write(path, contents.as_bytes()).map_err(write_err)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), String> {
    let dir = path
        .parent()
        .ok_or_else(|| "config path missing parent directory".to_string())?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| e.to_string())?;
    fs::write(temp.path(), data).map_err(|e| e.to_string())?;
    temp.persist(path).map_err(|e| e.to_string())?;
    Ok(())
}
