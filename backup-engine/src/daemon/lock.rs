//! Advisory file locks.
//!
//! `RunLock` guards one (source, mode) pair for the lifetime of a run. It is
//! a non-blocking `flock`, so a second invocation sees contention immediately
//! and exits instead of queueing. The kernel drops the lock if the process
//! dies, so a crashed run never leaves a stale lock behind.

use crate::utils::errors::{EngineError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Lock file content, for operators inspecting a busy lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub started_at: String,
}

/// An exclusive `flock` on a file, released on drop.
pub struct FileLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl FileLock {
    /// Block until the lock is acquired.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| EngineError::Io(errno.into()))?;
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    /// Acquire without waiting. `Ok(None)` when another holder has it.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self {
                path: path.to_path_buf(),
                _lock: lock,
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(EngineError::Io(errno.into())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    Ok(file)
}

/// Mutual exclusion for one (source, mode) pair.
pub struct RunLock {
    key: String,
    lock: FileLock,
}

impl RunLock {
    /// Lock file path for a (source, mode) pair.
    pub fn lock_path(state_dir: &Path, source_id: &str, mode: &str) -> PathBuf {
        state_dir.join("locks").join(format!("{source_id}.{mode}.lock"))
    }

    /// Acquire the run lock or fail with `LockContention`.
    pub fn acquire(state_dir: &Path, source_id: &str, mode: &str) -> Result<Self> {
        let key = format!("{source_id}.{mode}");
        let path = Self::lock_path(state_dir, source_id, mode);

        let Some(lock) = FileLock::try_exclusive(&path)? else {
            let holder = read_holder(&path);
            match holder {
                Some(h) => tracing::warn!(
                    lock = %key,
                    pid = h.pid,
                    since = %h.started_at,
                    "Another run holds the lock"
                ),
                None => tracing::warn!(lock = %key, "Another run holds the lock"),
            }
            return Err(EngineError::LockContention { key });
        };

        let mut run_lock = Self { key, lock };
        run_lock.write_holder()?;
        tracing::debug!(lock = %run_lock.key, "Run lock acquired");
        Ok(run_lock)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn write_holder(&mut self) -> Result<()> {
        let holder = LockHolder {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let serialized = serde_json::to_string(&holder)?;

        // Separate handle: the flock stays on the original descriptor.
        let mut file = OpenOptions::new().write(true).open(self.lock.path())?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
}
