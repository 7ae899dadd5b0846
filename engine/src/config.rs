use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "HOSTBRIDGE_CONFIG";

const DEFAULT_WORKER_THREADS: usize = 2;

const fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

fn default_main_thread_name() -> String {
    "host-main".to_string()
}

fn default_task_manager_thread_name() -> String {
    "task-manager".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How many background tasks may be in flight at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyLimit {
    /// Every submitted task is queued; the pool drains the queue.
    #[default]
    Unbounded,
    /// At most `slots` tasks are queued or running; `submit` blocks the
    /// submitter until a slot frees up.
    Bounded { slots: usize },
}

/// Names of the engine-owned loop threads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreadNames {
    #[serde(default = "default_main_thread_name")]
    pub main: String,
    #[serde(default = "default_task_manager_thread_name")]
    pub task_manager: String,
}

impl Default for ThreadNames {
    fn default() -> Self {
        Self {
            main: default_main_thread_name(),
            task_manager: default_task_manager_thread_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub concurrency: ConcurrencyLimit,
    /// Default timeout for bridged calls. Absent means calls wait forever.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Assert (debug builds only) when the host completes an id that was
    /// never issued.
    #[serde(default)]
    pub strict_completion: bool,
    #[serde(default)]
    pub threads: ThreadNames,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            concurrency: ConcurrencyLimit::Unbounded,
            call_timeout_ms: None,
            strict_completion: false,
            threads: ThreadNames::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `$HOSTBRIDGE_CONFIG` or `~/.hostbridge/config.toml`.
    ///
    /// A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        let config: Self = match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if let ConcurrencyLimit::Bounded { slots: 0 } = self.concurrency {
            return Err(ConfigError::Invalid(
                "bounded concurrency needs at least 1 slot".to_string(),
            ));
        }
        if self.threads.main.trim().is_empty() || self.threads.task_manager.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "thread names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(explicit) = env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(explicit));
    }
    dirs::home_dir().map(|home| home.join(".hostbridge").join("config.toml"))
}
