//! Local filesystem root (internal disks, NAS mounts).

use crate::storage::{BackendKind, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    id: String,
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }
}

impl StorageBackend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn ensure_available(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(EngineError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} does not exist or is not a directory", self.root.display()),
            )))
        }
    }
}
