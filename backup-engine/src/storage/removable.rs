//! Removable medium root.
//!
//! A medium counts as present only while its mount point holds the label
//! file written by [`RemovableBackend::initialize`]. An empty mount point
//! (medium unplugged, mount failed) therefore never receives writes that
//! would silently land on the host's own disk. Presence is re-checked before
//! every operation and again before a received copy is committed.

use crate::storage::{BackendKind, StorageBackend};
use crate::utils::atomic::write_atomic;
use crate::utils::errors::{EngineError, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const LABEL_FILE: &str = ".backup-medium";

#[derive(Debug, Clone)]
pub struct RemovableBackend {
    id: String,
    root: PathBuf,
    /// Expected label; any labelled medium is accepted when unset
    medium_id: Option<String>,
}

impl RemovableBackend {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>, medium_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            medium_id,
        }
    }

    /// Write the label that marks `root` as a usable medium.
    pub fn initialize(root: &Path, medium_id: &str) -> Result<()> {
        if !root.is_dir() {
            return Err(EngineError::MediumUnavailable(format!(
                "{} is not a mounted directory",
                root.display()
            )));
        }
        write_atomic(&root.join(LABEL_FILE), format!("{medium_id}\n").as_bytes())?;
        tracing::info!("Labelled medium at {} as '{}'", root.display(), medium_id);
        Ok(())
    }

    /// Label of the medium currently mounted at the root.
    pub fn label(&self) -> Option<String> {
        fs::read_to_string(self.root.join(LABEL_FILE))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl StorageBackend for RemovableBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Removable
    }

    fn ensure_available(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(EngineError::MediumUnavailable(format!(
                "{}: {} is not mounted",
                self.id,
                self.root.display()
            )));
        }
        match (self.label(), &self.medium_id) {
            (None, _) => Err(EngineError::MediumUnavailable(format!(
                "{}: no {} label at {}",
                self.id,
                LABEL_FILE,
                self.root.display()
            ))),
            (Some(found), Some(expected)) if &found != expected => {
                Err(EngineError::MediumUnavailable(format!(
                    "{}: found medium '{}', expected '{}'",
                    self.id, found, expected
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unlabelled_mount_point_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let backend = RemovableBackend::new("usb", dir.path(), None);

        let err = backend.ensure_available().unwrap_err();
        assert!(matches!(err, EngineError::MediumUnavailable(_)));
        assert!(backend.write_atomic("x", b"y").is_err());
    }

    #[test]
    fn test_labelled_medium_is_available() -> Result<()> {
        let dir = TempDir::new()?;
        RemovableBackend::initialize(dir.path(), "transfer-01")?;

        let backend = RemovableBackend::new("usb", dir.path(), Some("transfer-01".into()));
        backend.ensure_available()?;
        backend.write_atomic("handoff/marker.json", b"{}")?;
        assert_eq!(backend.label().as_deref(), Some("transfer-01"));
        Ok(())
    }

    #[test]
    fn test_wrong_medium_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        RemovableBackend::initialize(dir.path(), "other")?;

        let backend = RemovableBackend::new("usb", dir.path(), Some("transfer-01".into()));
        assert!(!backend.is_available());
        Ok(())
    }

    #[test]
    fn test_unplugged_medium_between_operations() -> Result<()> {
        let dir = TempDir::new()?;
        RemovableBackend::initialize(dir.path(), "m")?;
        let backend = RemovableBackend::new("usb", dir.path(), None);
        backend.write_atomic("a.txt", b"1")?;

        fs::remove_file(dir.path().join(LABEL_FILE))?;

        assert!(matches!(backend.read("a.txt"), Err(EngineError::MediumUnavailable(_))));
        Ok(())
    }
}
