//! Lock Manager: cross-process advisory locks on records.
//!
//! A record `P` is locked by the sidecar descriptor `P.lock`, a small JSON
//! object `{"pid": .., "createdAt": ..}`. Whoever manages to create that file
//! exclusively owns the record until it deletes it again.
//!
//! The descriptor is first written to a private temp file and then hard-linked
//! into place. `link(2)` fails when the target exists, so this keeps the
//! single-winner semantics of `create_new` while guaranteeing that nobody ever
//! observes a half-written descriptor. Filesystems without hard links fall
//! back to `create_new` + write.
//!
//! Contention handling:
//! - a descriptor that is unreadable, unparseable, older than the stale
//!   threshold, or names a dead holder is reclaimed and the create is retried
//!   at once (reclamation is expected, not an error);
//! - reclaiming renames the descriptor to a private tombstone and deletes it
//!   only if the tombstone still holds the bytes that were judged stale.
//!   Otherwise another waiter already replaced it, so it is linked back and
//!   the caller keeps waiting. Release uses the same compare step;
//! - otherwise the caller sleeps with exponential backoff until `timeout`,
//!   then gets `LockTimeout` naming the last holder seen.
//!
//! There is no fairness: the next waiter to win the create gets the lock.

use crate::core::error::WorkspaceError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub stale_threshold: Duration,
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(30),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// On-disk content of `<record>.lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub pid: u32,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Host capability answering "is this holder still running?".
pub trait Liveness: Send + Sync {
    fn is_alive(&self, holder_id: u32) -> bool;
}

impl<F> Liveness for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_alive(&self, holder_id: u32) -> bool {
        self(holder_id)
    }
}

/// Probes OS processes with the null signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_alive(&self, holder_id: u32) -> bool {
        if holder_id == 0 {
            return false;
        }
        #[cfg(unix)]
        {
            let Ok(pid) = libc::pid_t::try_from(holder_id) else {
                return false;
            };
            // SAFETY: signal 0 performs only the existence/permission check.
            let rc = unsafe { libc::kill(pid, 0) };
            if rc == 0 {
                return true;
            }
            // EPERM: the process exists but belongs to someone else.
            io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    HolderDead,
    Expired,
}

/// Snapshot of a record's lock as seen from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held {
        descriptor: LockDescriptor,
        age: Duration,
    },
    Stale {
        descriptor: LockDescriptor,
        reason: StaleReason,
    },
    /// Descriptor exists but is empty and younger than the stale threshold:
    /// its creator is still writing it.
    Pending { age: Duration },
    /// Descriptor exists but cannot be read or decoded.
    Corrupt,
}

impl LockStatus {
    fn is_reclaimable(&self) -> bool {
        matches!(self, LockStatus::Stale { .. } | LockStatus::Corrupt)
    }
}

/// Path of the descriptor guarding `record`.
pub fn lock_path(record: &Path) -> PathBuf {
    let mut name = record.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Absolute, lexically normalized form used as the lock key.
pub fn resolve_record_path(path: &Path) -> Result<PathBuf, WorkspaceError> {
    let absolute = std::path::absolute(path)?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

#[derive(Debug)]
struct HeldLock {
    owner: ThreadId,
    count: usize,
    body: Vec<u8>,
    descriptor_path: PathBuf,
}

/// A descriptor's classification together with the exact bytes it was
/// judged on.
struct Observation {
    status: LockStatus,
    raw: Vec<u8>,
}

/// In-process lock table plus the identity this process writes into descriptors.
///
/// Nested `with_lock` calls on the same path from the same thread only bump a
/// counter. Other threads of the process contend through the descriptor file
/// like any other process would.
pub struct LockRegistry {
    holder_id: u32,
    liveness: Arc<dyn Liveness>,
    held: Mutex<HashMap<PathBuf, HeldLock>>,
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("holder_id", &self.holder_id)
            .field("held", &self.table().len())
            .finish()
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    /// Registry for the current OS process.
    pub fn new() -> Self {
        Self::with_holder(std::process::id(), Arc::new(ProcessLiveness))
    }

    /// Registry writing `holder_id` into descriptors and judging other holders
    /// with `liveness`. Tests use this to simulate several processes.
    pub fn with_holder(holder_id: u32, liveness: Arc<dyn Liveness>) -> Self {
        Self {
            holder_id,
            liveness,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn holder_id(&self) -> u32 {
        self.holder_id
    }

    /// Run `f` while holding the lock on `path`; the lock is released on every
    /// exit path, including a panic inside `f`.
    pub fn with_lock<F, R>(
        &self,
        path: &Path,
        options: LockOptions,
        f: F,
    ) -> Result<R, WorkspaceError>
    where
        F: FnOnce() -> Result<R, WorkspaceError>,
    {
        let key = resolve_record_path(path)?;
        let _guard = self.acquire(key, options)?;
        f()
    }

    /// Reentrancy depth of `path` for the calling thread (0 when not held).
    pub fn hold_count(&self, path: &Path) -> usize {
        let Ok(key) = resolve_record_path(path) else {
            return 0;
        };
        let me = thread::current().id();
        self.table()
            .get(&key)
            .filter(|entry| entry.owner == me)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Read-only view of the lock on `path`.
    pub fn inspect(
        &self,
        path: &Path,
        stale_threshold: Duration,
    ) -> Result<LockStatus, WorkspaceError> {
        let key = resolve_record_path(path)?;
        Ok(self.classify(&lock_path(&key), stale_threshold))
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, HeldLock>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, key: PathBuf, options: LockOptions) -> Result<LockGuard<'_>, WorkspaceError> {
        let me = thread::current().id();
        if let Some(entry) = self.table().get_mut(&key) {
            if entry.owner == me {
                entry.count += 1;
                debug!(path = %key.display(), depth = entry.count, "reentrant lock");
                return Ok(LockGuard {
                    registry: self,
                    key,
                });
            }
        }

        let descriptor_path = lock_path(&key);
        if let Some(parent) = descriptor_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        let mut delay = INITIAL_BACKOFF;
        let mut last_holder: Option<u32> = None;

        loop {
            let descriptor = LockDescriptor {
                pid: self.holder_id,
                created_at: time::now_epoch_ms(),
            };
            let body = serde_json::to_vec(&descriptor)?;
            match publish_exclusive(&descriptor_path, &body) {
                Ok(()) => {
                    self.table().insert(
                        key.clone(),
                        HeldLock {
                            owner: me,
                            count: 1,
                            body,
                            descriptor_path,
                        },
                    );
                    debug!(
                        path = %key.display(),
                        waited_ms = start.elapsed().as_millis() as u64,
                        "lock acquired"
                    );
                    return Ok(LockGuard {
                        registry: self,
                        key,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(WorkspaceError::IoError(e)),
            }

            let Observation { status, raw } =
                self.observe(&descriptor_path, options.stale_threshold);
            match status {
                LockStatus::Free => continue,
                status if status.is_reclaimable() => {
                    if remove_if_unchanged(&descriptor_path, &raw)? {
                        info!(path = %key.display(), status = ?status, "reclaimed stale lock");
                        continue;
                    }
                    debug!(path = %key.display(), "descriptor replaced before reclaim");
                }
                LockStatus::Held { descriptor, .. } => last_holder = Some(descriptor.pid),
                LockStatus::Stale { .. } | LockStatus::Pending { .. } | LockStatus::Corrupt => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= options.timeout {
                warn!(
                    path = %key.display(),
                    holder = ?last_holder,
                    waited_ms = elapsed.as_millis() as u64,
                    "lock acquisition timed out"
                );
                return Err(WorkspaceError::LockTimeout {
                    path: key,
                    holder: last_holder,
                });
            }
            thread::sleep(delay.min(options.timeout - elapsed));
            delay = (delay * 2).min(options.max_backoff);
        }
    }

    fn classify(&self, descriptor_path: &Path, stale_threshold: Duration) -> LockStatus {
        self.observe(descriptor_path, stale_threshold).status
    }

    fn observe(&self, descriptor_path: &Path, stale_threshold: Duration) -> Observation {
        let raw = match fs::read(descriptor_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Observation {
                    status: LockStatus::Free,
                    raw: Vec::new(),
                };
            }
            Err(_) => {
                return Observation {
                    status: LockStatus::Corrupt,
                    raw: Vec::new(),
                };
            }
        };
        let status = self.status_of(descriptor_path, &raw, stale_threshold);
        Observation { status, raw }
    }

    fn status_of(&self, descriptor_path: &Path, raw: &[u8], stale_threshold: Duration) -> LockStatus {
        if raw.is_empty() {
            // Only the create_new fallback exposes an empty descriptor, and
            // only until its first write lands.
            let age = fs::metadata(descriptor_path)
                .and_then(|m| m.modified())
                .map(|mtime| SystemTime::now().duration_since(mtime).unwrap_or_default());
            return match age {
                Ok(age) if age <= stale_threshold => LockStatus::Pending { age },
                _ => LockStatus::Corrupt,
            };
        }
        let Ok(descriptor) = serde_json::from_slice::<LockDescriptor>(raw) else {
            return LockStatus::Corrupt;
        };
        if !self.liveness.is_alive(descriptor.pid) {
            return LockStatus::Stale {
                descriptor,
                reason: StaleReason::HolderDead,
            };
        }
        let age = time::age_of(descriptor.created_at, time::now_epoch_ms());
        if age > stale_threshold {
            return LockStatus::Stale {
                descriptor,
                reason: StaleReason::Expired,
            };
        }
        LockStatus::Held { descriptor, age }
    }

    fn release(&self, key: &Path) {
        let mut table = self.table();
        let me = thread::current().id();
        let Some(entry) = table.get_mut(key) else {
            return;
        };
        if entry.owner != me {
            return;
        }
        entry.count -= 1;
        if entry.count > 0 {
            return;
        }
        let Some(entry) = table.remove(key) else {
            return;
        };

        // Only delete the descriptor if it is still ours; a waiter may have
        // reclaimed it after we overran the stale threshold.
        match remove_if_unchanged(&entry.descriptor_path, &entry.body) {
            Ok(true) => debug!(path = %key.display(), "lock released"),
            Ok(false) => warn!(path = %key.display(), "lock was reclaimed while held"),
            Err(e) => warn!(path = %key.display(), error = %e, "failed to remove lock descriptor"),
        }
    }
}

struct LockGuard<'a> {
    registry: &'a LockRegistry,
    key: PathBuf,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.{}", Ulid::new(), suffix));
    PathBuf::from(name)
}

/// Exclusively create `descriptor_path` holding `body`.
fn publish_exclusive(descriptor_path: &Path, body: &[u8]) -> io::Result<()> {
    let staging = sibling_path(descriptor_path, "tmp");
    {
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)?;
        f.write_all(body)?;
        f.sync_all()?;
    }
    let linked = fs::hard_link(&staging, descriptor_path);
    let _ = fs::remove_file(&staging);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => {
            let mut f = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(descriptor_path)?;
            f.write_all(body)
        }
        Err(e) => Err(e),
    }
}

/// Delete `descriptor_path` if it still contains exactly `expected`.
///
/// Returns `Ok(false)` when the descriptor is gone or was replaced; a
/// replaced descriptor is put back unless yet another one already took
/// its place.
fn remove_if_unchanged(descriptor_path: &Path, expected: &[u8]) -> io::Result<bool> {
    let tombstone = sibling_path(descriptor_path, "reclaim");
    match fs::rename(descriptor_path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    let seen = fs::read(&tombstone);
    if matches!(&seen, Ok(raw) if raw.as_slice() == expected) {
        let _ = fs::remove_file(&tombstone);
        return Ok(true);
    }

    let restored = match fs::hard_link(&tombstone, descriptor_path) {
        Err(e) if e.kind() == io::ErrorKind::Unsupported => match &seen {
            Ok(raw) => publish_exclusive(descriptor_path, raw),
            Err(_) => Err(e),
        },
        other => other,
    };
    let _ = fs::remove_file(&tombstone);
    match restored {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}
