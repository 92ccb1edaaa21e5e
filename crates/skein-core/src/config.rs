use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Resource limits applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 256 * 1024 * 1024,
            max_stack_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the manager and handler services listen on.
    pub bind_addr: String,
    /// Runner executable. Looked up next to the current executable when unset.
    pub runner_binary: Option<PathBuf>,
    pub startup_timeout_ms: u64,
    pub health_poll_interval_ms: u64,
    pub stop_grace_ms: u64,
    /// HMAC secret for `skein.encodeJWT`.
    pub jwt_secret: Option<String>,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:50061".to_string(),
            runner_binary: None,
            startup_timeout_ms: 10_000,
            health_poll_interval_ms: 100,
            stop_grace_ms: 2_000,
            jwt_secret: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Default location, `<config_dir>/skein/worker.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("skein").join("worker.toml"))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, else the default location when it exists, else
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading worker config");
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "startup_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.health_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.sandbox.max_stack_bytes == 0 || self.sandbox.memory_limit_bytes == 0 {
            return Err(ConfigError::Invalid("sandbox limits must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
