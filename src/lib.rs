//! agentws: local-first workspaces for AI agents
//!
//! Agents keep their identity, reputation and other records as plain
//! files under `.agentws/`. Many agents, in many processes, update the same
//! files concurrently, so every mutation goes through one small core:
//!
//! - **Atomic writes** ([`crate::core::atomic`]): temp file + rename, with a bounded
//!   `.bak` chain. Readers see the old or the new content, never a mix.
//! - **Record locks** ([`crate::core::lock`]): a `<record>.lock` descriptor created
//!   exclusively, reentrant per thread, reclaimed when its holder died or it
//!   outlived the stale threshold.
//! - **Reputation** ([`plugins::reputation`]): per-dimension scores that decay
//!   toward 0.5 over time and absorb new signals through a moving average,
//!   each update a locked read-modify-write.
//!
//! # Examples
//!
//! ```bash
//! agentws init
//! agentws reputation post --agent alice --name Alice --dimension reliability --score 0.9
//! agentws reputation show --agent alice
//! agentws lock inspect --path reputation/alice.json
//! ```
//!
//! # Crate Structure
//!
//! - [`crate::core`]: store primitives (atomic write, locks, config, workspace layout)
//! - [`plugins`]: subsystems on top of the store (reputation, raw records)

pub mod core;
pub mod plugins;

use crate::core::{error, lock::LockRegistry, store::Workspace};
use plugins::{record, reputation};

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "agentws",
    version = env!("CARGO_PKG_VERSION"),
    about = "Agent workspaces: locked records and decayed reputation"
)]
struct Cli {
    /// Workspace root (defaults to the nearest parent containing `.agentws/`).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create `.agentws/` with a default config.
    Init {
        /// Directory to initialize (defaults to current working directory).
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },

    /// Agent reputation signals and profiles
    Reputation(reputation::ReputationCli),

    /// Raw record access
    Record(record::RecordCli),

    /// Record lock diagnostics
    Lock(record::LockCli),

    /// Print version
    Version,
}

fn open_workspace(
    root: Option<PathBuf>,
    current_dir: &Path,
) -> Result<Workspace, error::WorkspaceError> {
    match root {
        Some(root) => Workspace::open(&root),
        None => Workspace::discover(current_dir),
    }
}

pub fn run() -> Result<(), error::WorkspaceError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;
    // One registry per process; every record lock taken by this invocation
    // goes through it.
    let locks = Arc::new(LockRegistry::new());

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
        }
        Command::Init { dir } => {
            let target_dir = dir.or(cli.root).unwrap_or(current_dir);
            let workspace = Workspace::init(&target_dir)?;
            println!("Workspace initialized at {}", workspace.state_dir().display());
        }
        Command::Reputation(rep_cli) => {
            let workspace = open_workspace(cli.root, &current_dir)?;
            reputation::run_reputation_cli(&workspace, locks, rep_cli)?;
        }
        Command::Record(record_cli) => {
            let workspace = open_workspace(cli.root, &current_dir)?;
            record::run_record_cli(&workspace, &locks, record_cli)?;
        }
        Command::Lock(lock_cli) => {
            let workspace = open_workspace(cli.root, &current_dir)?;
            record::run_lock_cli(&workspace, &locks, lock_cli)?;
        }
    }
    Ok(())
}
