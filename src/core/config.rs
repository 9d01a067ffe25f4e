//! Workspace configuration from `.agentws/config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! A file that exists but does not parse is a `ConfigError`: unlike records,
//! configuration is operator-authored and silently ignoring it would hide typos.

use crate::core::atomic::WriteOptions;
use crate::core::error::WorkspaceError;
use crate::core::lock::LockOptions;
use crate::core::time::MS_PER_DAY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub reputation: ReputationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backup: bool,
    pub max_backups: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backup: true,
            max_backups: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub stale_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            stale_ms: 30_000,
            max_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Exponential decay per month toward the neutral prior.
    pub decay_rate: f64,
    /// Weight of a new signal in the moving average.
    pub fusion_weight: f64,
    pub month_ms: i64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.02,
            fusion_weight: 0.15,
            month_ms: 30 * MS_PER_DAY,
        }
    }
}

impl WorkspaceConfig {
    /// Load `<state_dir>/config.toml`, falling back to defaults when absent.
    pub fn load(state_dir: &Path) -> Result<Self, WorkspaceError> {
        let path = state_dir.join(CONFIG_FILE_NAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(WorkspaceError::IoError(e)),
        };
        let config: WorkspaceConfig = toml::from_str(&content)
            .map_err(|e| WorkspaceError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkspaceError> {
        let rep = &self.reputation;
        if !(rep.fusion_weight > 0.0 && rep.fusion_weight <= 1.0) {
            return Err(WorkspaceError::ConfigError(format!(
                "reputation.fusion_weight must be in (0, 1], got {}",
                rep.fusion_weight
            )));
        }
        if !rep.decay_rate.is_finite() || rep.decay_rate < 0.0 {
            return Err(WorkspaceError::ConfigError(format!(
                "reputation.decay_rate must be a non-negative number, got {}",
                rep.decay_rate
            )));
        }
        if rep.month_ms <= 0 {
            return Err(WorkspaceError::ConfigError(
                "reputation.month_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, WorkspaceError> {
        toml::to_string_pretty(self).map_err(|e| WorkspaceError::ConfigError(e.to_string()))
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            backup: self.store.backup,
            max_backups: self.store.max_backups,
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.lock.timeout_ms),
            stale_threshold: Duration::from_millis(self.lock.stale_ms),
            max_backoff: Duration::from_millis(self.lock.max_backoff_ms.max(1)),
        }
    }
}
