use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("could not update {}: busy ({})", path.display(), holder_label(*holder))]
    LockTimeout {
        path: PathBuf,
        /// Last holder observed in the lock descriptor, if it could be read.
        holder: Option<u32>,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

fn holder_label(holder: Option<u32>) -> String {
    match holder {
        Some(pid) => format!("held by pid {}", pid),
        None => "holder unknown".to_string(),
    }
}
