//! Write-then-rename helpers shared by every durable write in the engine.
//!
//! A file produced through these helpers is either absent or complete under
//! its final name. Temporary names are hidden (`.<name>.tmp-<uuid>`) so
//! directory listings never mistake them for committed files.

use crate::utils::errors::{EngineError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const TEMP_MARKER: &str = ".tmp-";

/// Hidden temporary path in the same directory as `final_path`.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    let tmp_name = format!(".{}{}{}", name, TEMP_MARKER, uuid::Uuid::new_v4().simple());
    final_path.with_file_name(tmp_name)
}

pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// fsync a directory so a rename inside it is durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Removes the temporary file on drop unless it was committed.
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename into place. Refuses to replace an existing file.
    pub fn commit(mut self, final_path: &Path) -> Result<()> {
        commit_rename(&self.path, final_path, false)?;
        self.armed = false;
        Ok(())
    }

    /// Rename into place, replacing whatever is there.
    pub fn commit_replace(mut self, final_path: &Path) -> Result<()> {
        commit_rename(&self.path, final_path, true)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn commit_rename(tmp: &Path, final_path: &Path, replace: bool) -> Result<()> {
    let commit_err = |source: io::Error| EngineError::Commit {
        path: final_path.to_path_buf(),
        source,
    };

    if replace {
        fs::rename(tmp, final_path).map_err(commit_err)?;
    } else {
        link_new(tmp, final_path).map_err(commit_err)?;
    }
    if let Some(parent) = final_path.parent() {
        sync_dir(parent).map_err(commit_err)?;
    }
    Ok(())
}

/// Place `tmp` under `final_path` only if nothing is there. The link either
/// claims the name or fails with `AlreadyExists`; media without hard links
/// fall back to check-then-rename.
fn link_new(tmp: &Path, final_path: &Path) -> io::Result<()> {
    match fs::hard_link(tmp, final_path) {
        Ok(()) => {
            // The committed name already holds the data
            let _ = fs::remove_file(tmp);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "refusing to overwrite a committed file",
        )),
        Err(_) if final_path.exists() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "refusing to overwrite a committed file",
        )),
        Err(_) => fs::rename(tmp, final_path),
    }
}

/// Durably write `bytes` to `path`, replacing any previous content atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let guard = TempFileGuard::new(temp_path_for(path));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(guard.path())?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    guard.commit_replace(path)
}

/// Like [`write_atomic`] but fails if `path` already exists.
pub fn write_atomic_new(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let guard = TempFileGuard::new(temp_path_for(path));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(guard.path())?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    guard.commit(path)
}
