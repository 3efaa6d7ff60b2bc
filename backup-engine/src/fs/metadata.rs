//! File attributes preserved by archives.
//!
//! Captures mode bits and modification time at scan time and re-applies them
//! on restore, so a restored tree matches the source attribute-for-attribute.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Attributes stored alongside every archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// Unix mode bits (permissions only)
    pub mode: u32,

    /// Modification time, seconds since Unix epoch
    pub mtime_secs: i64,

    /// Sub-second part of the modification time
    pub mtime_nanos: u32,
}

impl FileAttributes {
    /// Extract attributes from metadata that was already fetched
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let (mode, mtime_secs, mtime_nanos) = {
            use std::os::unix::fs::MetadataExt;
            (
                metadata.mode() & 0o7777,
                metadata.mtime(),
                metadata.mtime_nsec().clamp(0, 999_999_999) as u32,
            )
        };

        #[cfg(not(unix))]
        let (mode, mtime_secs, mtime_nanos) = {
            let since = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .unwrap_or_default();
            (0o644, since.as_secs() as i64, since.subsec_nanos())
        };

        Self {
            mode,
            mtime_secs,
            mtime_nanos,
        }
    }

    /// Extract attributes from a path (not following symlinks)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_metadata(&fs::symlink_metadata(path)?))
    }

    pub fn modified(&self) -> SystemTime {
        if self.mtime_secs >= 0 {
            UNIX_EPOCH + Duration::new(self.mtime_secs as u64, self.mtime_nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.mtime_secs.unsigned_abs())
                + Duration::from_nanos(self.mtime_nanos as u64)
        }
    }

    /// Apply mode and mtime to a regular file or directory.
    /// Mtime goes first: a restrictive mode could prevent reopening the file.
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        {
            let file = File::options().read(true).open(path)?;
            file.set_modified(self.modified())?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(self.mode))?;
        }

        Ok(())
    }
}
