//! Single-instance lock for batch runs.
//!
//! A run takes an exclusive lock file before touching the registry, so two
//! coordinators never interleave claims. The lock records the owning pid and
//! acquisition time; a leftover lock from a crashed run is detected as stale
//! (dead owner, or simply too old) and replaced.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("another run holds the lock (unreadable lock file, {age_secs}s old)")]
    AlreadyRunningUnknown { age_secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How stale locks are detected.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// A lock older than this is stale regardless of its owner.
    pub stale_after: Duration,
    /// Whether to check if the recorded pid is still alive. Disabled in
    /// tests that fabricate lock files for running pids.
    pub probe_process: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3600),
            probe_process: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

enum Holder {
    Stale,
    Alive { pid: u32 },
    Unknown { age_secs: u64 },
}

/// An acquired run lock. Dropping it removes the lock file, so the lock is
/// released on every exit path; [`RunLock::release`] reports removal errors
/// on the happy path.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    /// Creates the lock file exclusively. If one already exists it is
    /// inspected against `policy`: a stale lock is removed and replaced,
    /// a live one fails the acquisition.
    pub fn acquire(path: &Path, policy: &LockPolicy) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        match Self::try_create(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                match Self::inspect_holder(path, policy)? {
                    Holder::Alive { pid } => return Err(LockError::AlreadyRunning { pid }),
                    Holder::Unknown { age_secs } => {
                        return Err(LockError::AlreadyRunningUnknown { age_secs });
                    }
                    Holder::Stale => {
                        eprintln!("warning: replacing stale lock {}", path.display());
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(err) if err.kind() == ErrorKind::NotFound => {}
                            Err(err) => return Err(err.into()),
                        }
                        Self::try_create(path)?;
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file. A file already gone counts as released.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&info).map_err(std::io::Error::other)?;
        file.write_all(&body)?;
        Ok(())
    }

    fn inspect_holder(path: &Path, policy: &LockPolicy) -> Result<Holder, LockError> {
        let info = fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockInfo>(&bytes).ok());

        let Some(info) = info else {
            // Unreadable lock file. Fall back to its age on disk.
            let age = lock_file_age(path)?;
            if age >= policy.stale_after {
                return Ok(Holder::Stale);
            }
            return Ok(Holder::Unknown {
                age_secs: age.as_secs(),
            });
        };

        let age_secs = Utc::now()
            .signed_duration_since(info.acquired_at)
            .num_seconds()
            .max(0);
        let stale_secs = i64::try_from(policy.stale_after.as_secs()).unwrap_or(i64::MAX);
        let expired = age_secs >= stale_secs;
        let dead = policy.probe_process && !process_alive(info.pid);

        if expired || dead {
            Ok(Holder::Stale)
        } else {
            Ok(Holder::Alive { pid: info.pid })
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn lock_file_age(path: &Path) -> Result<Duration, LockError> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
