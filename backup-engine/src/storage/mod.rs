//! Storage roots.
//!
//! Every place an artifact can live (primary candidates, mirrors, the
//! handoff medium, an importer's vault) is a [`StorageBackend`]. Paths given
//! to a backend are `/`-separated and relative to its root. Backends differ
//! in how they decide they are usable: a local root only has to exist, a
//! removable medium must also carry its label and is re-checked before
//! every operation.

pub mod local;
pub mod removable;
pub mod selector;

use crate::integrity::{self, ContentHash};
use crate::transfer::copy::{copy_with_resume, partial_path_for};
use crate::transfer::progress::TransferSummary;
use crate::utils::atomic::{self, is_temp_name, TempFileGuard};
use crate::utils::errors::{EngineError, Result};
pub use local::LocalBackend;
pub use removable::RemovableBackend;
pub use selector::DestinationSelector;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Removable,
}

pub trait StorageBackend: Send + Sync {
    fn id(&self) -> &str;

    fn root(&self) -> &Path;

    fn kind(&self) -> BackendKind;

    /// Fails when the root cannot be used right now.
    fn ensure_available(&self) -> Result<()>;

    fn is_available(&self) -> bool {
        self.ensure_available().is_ok()
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        rel.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root().to_path_buf(), |path, part| path.join(part))
    }

    /// Real write + read-back + delete in the root.
    fn check_writable(&self) -> Result<()> {
        self.ensure_available()?;
        let scratch = self
            .root()
            .join(format!(".write-check-{}", uuid::Uuid::new_v4().simple()));
        let payload = b"backup-engine write check";

        let result = (|| -> io::Result<()> {
            fs::write(&scratch, payload)?;
            fs::File::open(&scratch)?.sync_all()?;
            if fs::read(&scratch)? != payload {
                return Err(io::Error::new(io::ErrorKind::Other, "write check read-back mismatch"));
            }
            Ok(())
        })();
        let cleanup = fs::remove_file(&scratch);

        result?;
        cleanup?;
        Ok(())
    }

    /// Bytes available to unprivileged writers.
    fn free_space(&self) -> Result<u64> {
        self.ensure_available()?;
        let stat = nix::sys::statvfs::statvfs(self.root()).map_err(io::Error::from)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn exists(&self, rel: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.resolve(rel).exists())
    }

    fn read(&self, rel: &str) -> Result<Vec<u8>> {
        self.ensure_available()?;
        Ok(fs::read(self.resolve(rel))?)
    }

    fn write_atomic(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_available()?;
        atomic::write_atomic(&self.resolve(rel), bytes)
    }

    fn hash(&self, rel: &str) -> Result<ContentHash> {
        self.ensure_available()?;
        integrity::hash_file(&self.resolve(rel))
    }

    fn remove(&self, rel: &str) -> Result<bool> {
        self.ensure_available()?;
        match fs::remove_file(self.resolve(rel)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// File names directly inside `rel_dir`, sorted; temp and partial files
    /// are skipped.
    fn list(&self, rel_dir: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let entries = match fs::read_dir(self.resolve(rel_dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !is_temp_name(n) && !n.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Subdirectory names directly inside `rel_dir`, sorted.
    fn list_dirs(&self, rel_dir: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let entries = match fs::read_dir(self.resolve(rel_dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Copy `src` to `rel` with verify-then-commit: the bytes land in a
    /// resumable partial, are hashed on this backend, and only a matching
    /// copy is renamed into place. A mismatching partial is discarded.
    fn receive_verified(&self, src: &Path, rel: &str, expected: &ContentHash) -> Result<TransferSummary> {
        self.ensure_available()?;
        let dest = self.resolve(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let partial = partial_path_for(&dest);
        let summary = copy_with_resume(src, &partial)?;

        // The medium may have vanished while we were writing.
        self.ensure_available()?;
        let actual = integrity::hash_file(&partial)?;
        if actual != *expected {
            let _ = fs::remove_file(&partial);
            return Err(EngineError::integrity(&dest, expected, actual));
        }

        TempFileGuard::new(partial).commit_replace(&dest)?;
        Ok(summary)
    }
}

/// Build the backend matching a configured root.
pub fn backend_for(id: &str, path: &Path, removable: bool, medium_id: Option<&str>) -> Arc<dyn StorageBackend> {
    if removable {
        Arc::new(RemovableBackend::new(id, path, medium_id.map(str::to_string)))
    } else {
        Arc::new(LocalBackend::new(id, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_strips_traversal() {
        let backend = LocalBackend::new("a", "/mnt/a");
        assert_eq!(backend.resolve("src/../x.pack"), PathBuf::from("/mnt/a/src/x.pack"));
        assert_eq!(backend.resolve("/abs"), PathBuf::from("/mnt/a/abs"));
    }

    #[test]
    fn test_receive_verified_commits_matching_copy() -> Result<()> {
        let src_dir = TempDir::new()?;
        let dst_dir = TempDir::new()?;
        let src = src_dir.path().join("a.pack");
        fs::write(&src, b"artifact bytes")?;

        let backend = LocalBackend::new("mirror", dst_dir.path());
        let expected = integrity::hash_bytes(b"artifact bytes");
        backend.receive_verified(&src, "projects/a.pack", &expected)?;

        assert_eq!(backend.read("projects/a.pack")?, b"artifact bytes");
        assert_eq!(backend.list("projects")?, vec!["a.pack"]);
        Ok(())
    }

    #[test]
    fn test_receive_verified_rejects_mismatch() -> Result<()> {
        let src_dir = TempDir::new()?;
        let dst_dir = TempDir::new()?;
        let src = src_dir.path().join("a.pack");
        fs::write(&src, b"actual")?;

        let backend = LocalBackend::new("mirror", dst_dir.path());
        let err = backend
            .receive_verified(&src, "a.pack", &integrity::hash_bytes(b"expected"))
            .unwrap_err();

        assert!(matches!(err, EngineError::Integrity { .. }));
        assert!(!backend.exists("a.pack")?);
        assert!(!partial_path_for(&dst_dir.path().join("a.pack")).exists());
        Ok(())
    }

    #[test]
    fn test_write_check_and_free_space() -> Result<()> {
        let dir = TempDir::new()?;
        let backend = LocalBackend::new("disk", dir.path());
        backend.check_writable()?;
        assert!(backend.free_space()? > 0);
        assert!(backend.list("")?.is_empty());
        Ok(())
    }
}
