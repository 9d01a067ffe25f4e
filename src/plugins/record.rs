//! Raw record and lock access for operators.
//!
//! `record put` is a locked atomic write, `record get` an unlocked snapshot
//! read, and `lock inspect` reports the state of a record's descriptor
//! without touching it.

use crate::core::atomic::{self, WriteOptions};
use crate::core::error::WorkspaceError;
use crate::core::lock::{LockRegistry, LockStatus, StaleReason, resolve_record_path};
use crate::core::store::Workspace;
use crate::core::time;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(name = "record", about = "Read and write raw workspace records")]
pub struct RecordCli {
    #[clap(subcommand)]
    pub command: RecordCommand,
}

#[derive(Subcommand, Debug)]
pub enum RecordCommand {
    /// Atomically replace a record under its lock.
    Put {
        #[clap(long)]
        path: PathBuf,
        /// Inline content.
        #[clap(long, conflicts_with = "file")]
        content: Option<String>,
        /// Read content from this file instead.
        #[clap(long)]
        file: Option<PathBuf>,
        /// Skip backup rotation for this write.
        #[clap(long)]
        no_backup: bool,
    },
    /// Print a record's current content.
    Get {
        #[clap(long)]
        path: PathBuf,
    },
}

#[derive(Parser, Debug)]
#[clap(name = "lock", about = "Inspect record locks")]
pub struct LockCli {
    #[clap(subcommand)]
    pub command: LockCommand,
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Show who holds a record's lock and whether it is reclaimable.
    Inspect {
        #[clap(long)]
        path: PathBuf,
    },
}

/// Relative record paths are taken relative to the workspace state dir.
/// Paths that end up outside it are rejected.
pub fn resolve_in_workspace(workspace: &Workspace, path: &Path) -> Result<PathBuf, WorkspaceError> {
    let state_dir = resolve_record_path(&workspace.state_dir())?;
    let resolved = resolve_record_path(&state_dir.join(path))?;
    if resolved == state_dir || !resolved.starts_with(&state_dir) {
        return Err(WorkspaceError::ValidationError(format!(
            "record path {} is outside {}",
            path.display(),
            state_dir.display()
        )));
    }
    Ok(resolved)
}

/// Locked atomic write of `content`; returns the resolved record path.
pub fn put_record(
    workspace: &Workspace,
    locks: &LockRegistry,
    path: &Path,
    content: &str,
    options: WriteOptions,
) -> Result<PathBuf, WorkspaceError> {
    let path = resolve_in_workspace(workspace, path)?;
    locks.with_lock(&path, workspace.config.lock_options(), || {
        atomic::atomic_write(&path, content, options)
    })?;
    Ok(path)
}

pub fn run_record_cli(
    workspace: &Workspace,
    locks: &LockRegistry,
    cli: RecordCli,
) -> Result<(), WorkspaceError> {
    match cli.command {
        RecordCommand::Put {
            path,
            content,
            file,
            no_backup,
        } => {
            let body = match (content, file) {
                (Some(content), _) => content,
                (None, Some(file)) => fs::read_to_string(&file)?,
                (None, None) => {
                    return Err(WorkspaceError::ValidationError(
                        "record put needs --content or --file".to_string(),
                    ));
                }
            };
            let options = if no_backup {
                WriteOptions::no_backup()
            } else {
                workspace.config.write_options()
            };
            let written = put_record(workspace, locks, &path, &body, options)?;
            println!("Record written: {}", written.display());
        }
        RecordCommand::Get { path } => {
            let path = resolve_in_workspace(workspace, &path)?;
            match atomic::load_file(&path)? {
                Some(content) => print!("{}", content),
                None => {
                    return Err(WorkspaceError::NotFound(format!(
                        "record {}",
                        path.display()
                    )));
                }
            }
        }
    }
    Ok(())
}

pub fn run_lock_cli(
    workspace: &Workspace,
    locks: &LockRegistry,
    cli: LockCli,
) -> Result<(), WorkspaceError> {
    match cli.command {
        LockCommand::Inspect { path } => {
            let path = resolve_in_workspace(workspace, &path)?;
            let stale = workspace.config.lock_options().stale_threshold;
            println!("{}", describe_status(&locks.inspect(&path, stale)?));
        }
    }
    Ok(())
}

pub fn describe_status(status: &LockStatus) -> String {
    match status {
        LockStatus::Free => "free".to_string(),
        LockStatus::Held { descriptor, age } => format!(
            "held by pid {} since {} ({} ms)",
            descriptor.pid,
            time::epoch_ms_to_z(descriptor.created_at),
            age.as_millis()
        ),
        LockStatus::Stale { descriptor, reason } => {
            let why = match reason {
                StaleReason::HolderDead => "holder is not running",
                StaleReason::Expired => "older than stale threshold",
            };
            format!("stale (pid {}, {}); next writer reclaims it", descriptor.pid, why)
        }
        LockStatus::Pending { age } => {
            format!("being created ({} ms); holder not yet written", age.as_millis())
        }
        LockStatus::Corrupt => "corrupt descriptor; next writer reclaims it".to_string(),
    }
}
