//! Atomic Write Manager.
//!
//! Readers of a record observe either the previous full content or the new
//! full content, never a torn write. The new bytes go to a temp file in the
//! target's own directory (so the final rename never crosses a filesystem)
//! and are renamed over the target.
//!
//! Failure policy, in one place:
//! - backup rotation is best-effort: any error there is logged and swallowed;
//! - everything on the primary write path propagates, and the target is left
//!   untouched when the failure happens before the rename;
//! - `load_json` normalizes unparseable content to `None`. Callers relying on
//!   that say so where they call it.

use crate::core::error::WorkspaceError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub backup: bool,
    /// Size of the backup chain (`.bak` plus `.bak.1` .. `.bak.(n-1)`). Zero disables it.
    pub max_backups: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            backup: true,
            max_backups: 5,
        }
    }
}

impl WriteOptions {
    pub fn no_backup() -> Self {
        Self {
            backup: false,
            max_backups: 0,
        }
    }
}

/// Path of the `index`-th backup: `P.bak` for 0, `P.bak.<index>` otherwise.
pub fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    if index == 0 {
        name.push(".bak");
    } else {
        name.push(format!(".bak.{}", index));
    }
    PathBuf::from(name)
}

/// Write `content` to `path` atomically, rotating the backup chain first.
pub fn atomic_write(
    path: &Path,
    content: impl AsRef<[u8]>,
    options: WriteOptions,
) -> Result<(), WorkspaceError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let tmp_path = temp_path_for(path);
    if let Err(e) = write_temp(&tmp_path, content.as_ref()) {
        let _ = fs::remove_file(&tmp_path);
        return Err(WorkspaceError::IoError(e));
    }

    if options.backup && path.exists() {
        rotate_backups(path, options.max_backups);
    }

    match fs::rename(&tmp_path, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            // Degraded path: not atomic for the duration of the copy.
            warn!(path = %path.display(), "rename crosses devices; falling back to copy");
            let copied = fs::copy(&tmp_path, path);
            let _ = fs::remove_file(&tmp_path);
            copied?;
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(WorkspaceError::IoError(e));
        }
    }

    debug!(path = %path.display(), bytes = content.as_ref().len(), "record written");
    Ok(())
}

/// `atomic_write` of a value as pretty-printed JSON with a trailing newline.
pub fn safe_write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    options: WriteOptions,
) -> Result<(), WorkspaceError> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    atomic_write(path, body, options)
}

/// Read a record as text. `None` when the file does not exist.
pub fn load_file(path: &Path) -> Result<Option<String>, WorkspaceError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(WorkspaceError::IoError(e)),
    };
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Some(text)),
        Err(_) => {
            warn!(path = %path.display(), "record is not valid UTF-8; treating as absent");
            Ok(None)
        }
    }
}

/// Read and decode a JSON record. Absent *and* unparseable both yield `None`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, WorkspaceError> {
    let Some(text) = load_file(path)? else {
        return Ok(None);
    };
    match serde_json::from_str(&text) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt record; treating as absent");
            Ok(None)
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!(".{}.{}.tmp", file_name, Ulid::new());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

fn write_temp(tmp_path: &Path, content: &[u8]) -> io::Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp_path)?;
    f.write_all(content)?;
    f.sync_all()
}

/// Shift the chain one slot older and copy the current target into `.bak`.
///
/// Best-effort: every failure in here, permission errors included, is logged
/// and swallowed. The primary write proceeds regardless.
fn rotate_backups(path: &Path, max_backups: usize) {
    if max_backups == 0 {
        return;
    }

    // Drop the oldest slot and anything beyond the bound (left behind when
    // `max_backups` was lowered).
    let mut index = max_backups - 1;
    loop {
        let candidate = backup_path(path, index);
        if !candidate.exists() {
            if index >= max_backups {
                break;
            }
        } else if let Err(e) = fs::remove_file(&candidate) {
            warn!(backup = %candidate.display(), error = %e, "failed to drop old backup");
        }
        index += 1;
    }

    for i in (0..max_backups - 1).rev() {
        let from = backup_path(path, i);
        if !from.exists() {
            continue;
        }
        let to = backup_path(path, i + 1);
        if let Err(e) = fs::rename(&from, &to) {
            warn!(from = %from.display(), to = %to.display(), error = %e, "failed to shift backup");
        }
    }

    let newest = backup_path(path, 0);
    if let Err(e) = fs::copy(path, &newest) {
        warn!(backup = %newest.display(), error = %e, "failed to back up record");
    }
}
