//! Kernel configuration

use super::message::Signal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("boot path {0:?} must be absolute")]
    RelativeBootPath(String),
    #[error("reap interval must be greater than zero")]
    ZeroReapInterval,
}

/// Kernel configuration. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Executable started as the root process
    pub boot_path: String,
    /// Extra arguments for the root process
    pub boot_args: Vec<String>,
    /// How often FINISHED processes are removed from the process table
    pub reap_interval_ms: u64,
    /// Signal number of keyboard interrupts
    pub keyboard_signal: Signal,
    /// Stop the run loop once the root process has finished
    pub halt_on_root_exit: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            boot_path: "/boot/init".to_string(),
            boot_args: Vec::new(),
            reap_interval_ms: 1000,
            keyboard_signal: Signal::KEYBOARD,
            halt_on_root_exit: true,
        }
    }
}

impl KernelConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.boot_path.starts_with('/') {
            return Err(ConfigError::RelativeBootPath(self.boot_path.clone()));
        }
        if self.reap_interval_ms == 0 {
            return Err(ConfigError::ZeroReapInterval);
        }
        Ok(())
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// argv of the root process
    pub fn boot_argv(&self) -> Vec<String> {
        std::iter::once(self.boot_path.clone())
            .chain(self.boot_args.iter().cloned())
            .collect()
    }
}
