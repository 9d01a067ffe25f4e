//! Workspace handle: where records live.
//!
//! A workspace is any directory containing `.agentws/`. Records are addressed
//! by paths under that state directory; the record CLI rejects paths that
//! resolve outside it.

use crate::core::config::{CONFIG_FILE_NAME, WorkspaceConfig};
use crate::core::error::WorkspaceError;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const STATE_DIR_NAME: &str = ".agentws";
pub const REPUTATION_DIR_NAME: &str = "reputation";

fn agent_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("agent id regex is valid")
    })
}

/// Agent ids double as file names, so they are restricted to a safe charset.
pub fn validate_agent_id(agent_id: &str) -> Result<(), WorkspaceError> {
    if agent_id_re().is_match(agent_id) && !agent_id.contains("..") {
        Ok(())
    } else {
        Err(WorkspaceError::ValidationError(format!(
            "invalid agent id '{}': use letters, digits, '.', '_' or '-'",
            agent_id
        )))
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    /// Directory containing `.agentws/`.
    pub root: PathBuf,
    pub config: WorkspaceConfig,
}

impl Workspace {
    /// Open the workspace at `root`, loading its config.
    pub fn open(root: &Path) -> Result<Self, WorkspaceError> {
        let state_dir = root.join(STATE_DIR_NAME);
        if !state_dir.is_dir() {
            return Err(WorkspaceError::NotFound(format!(
                "'{}' not found in {}. Run `agentws init` first.",
                STATE_DIR_NAME,
                root.display()
            )));
        }
        let config = WorkspaceConfig::load(&state_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    /// Walk up from `start_dir` to the nearest directory holding `.agentws/`.
    pub fn discover(start_dir: &Path) -> Result<Self, WorkspaceError> {
        let mut current_dir = PathBuf::from(start_dir);
        loop {
            if current_dir.join(STATE_DIR_NAME).is_dir() {
                return Self::open(&current_dir);
            }
            if !current_dir.pop() {
                return Err(WorkspaceError::NotFound(format!(
                    "'{}' directory not found in current or parent directories. Run `agentws init` first.",
                    STATE_DIR_NAME
                )));
            }
        }
    }

    /// Create `.agentws/` with a default config, leaving an existing config alone.
    pub fn init(root: &Path) -> Result<Self, WorkspaceError> {
        let state_dir = root.join(STATE_DIR_NAME);
        fs::create_dir_all(state_dir.join(REPUTATION_DIR_NAME))?;
        let config_path = state_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let body = WorkspaceConfig::default().to_toml()?;
            crate::core::atomic::atomic_write(
                &config_path,
                body,
                crate::core::atomic::WriteOptions::no_backup(),
            )?;
        }
        Self::open(root)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    pub fn reputation_dir(&self) -> PathBuf {
        self.state_dir().join(REPUTATION_DIR_NAME)
    }

    /// Record path of an agent's reputation profile.
    pub fn profile_path(&self, agent_id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_agent_id(agent_id)?;
        Ok(self.reputation_dir().join(format!("{}.json", agent_id)))
    }
}
