//! Scheduler configuration
//!
//! Machine-wide defaults live in `~/.lattice/config.json`; a composite
//! description may override them per invocation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// What happens to the rest of the invocation when a task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Only tasks that (transitively) need the failed task fail
    #[default]
    AbortDependents,
    /// Tasks that have not started yet fail as well
    AbortAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the shared worker pool
    pub max_workers: usize,
    pub failure_policy: FailurePolicy,
    /// Where previous-execution snapshots are kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            failure_policy: FailurePolicy::default(),
            state_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// State directory for a composite rooted at `root`
    pub fn state_dir_for(&self, root: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => default_state_dir(root),
        }
    }
}

pub fn default_state_dir(root: &Path) -> PathBuf {
    root.join(".lattice").join("state")
}

/// Get config file path (~/.lattice/config.json)
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lattice")
        .join("config.json")
}

/// Load machine-wide defaults; missing file means built-in defaults
pub fn load_config() -> Result<SchedulerConfig, ConfigError> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &Path) -> Result<SchedulerConfig, ConfigError> {
    if !path.exists() {
        return Ok(SchedulerConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Save machine-wide defaults
pub fn save_config(config: &SchedulerConfig) -> Result<PathBuf, ConfigError> {
    let path = get_config_path();
    save_config_to(config, &path)?;
    Ok(path)
}

pub fn save_config_to(config: &SchedulerConfig, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let content = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, content).map_err(io_err)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}
