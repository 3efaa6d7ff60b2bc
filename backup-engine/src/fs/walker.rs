//! Directory traversal for capture.
//!
//! Produces one [`ScanEntry`] per file, directory and symlink under a source
//! root, with the identity fields (size, mtime, inode) the snapshot tracker
//! compares between runs.

use crate::fs::metadata::FileAttributes;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Entry names to skip, including their whole subtree
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Full path on disk
    pub path: PathBuf,

    /// Relative path from the root, `/`-separated
    pub relative: String,

    pub kind: EntryKind,

    /// File size in bytes (0 for directories)
    pub size: u64,

    pub inode: u64,

    pub attrs: FileAttributes,

    /// Link target for symlinks
    pub link_target: Option<String>,
}

impl ScanEntry {
    /// Returns None for special files (sockets, fifos, devices). A name or
    /// link target that is not UTF-8 fails the walk instead of being dropped
    /// from the capture.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let metadata = entry.metadata()?;
        let file_type = entry.file_type();

        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            tracing::debug!("Skipping special file {}", entry.path().display());
            return Ok(None);
        };

        let relative = relative_string(entry.path(), root)
            .ok_or_else(|| unrepresentable("path", entry.path()))?;

        let link_target = if kind == EntryKind::Symlink {
            let target = std::fs::read_link(entry.path())?;
            let target = target
                .to_str()
                .ok_or_else(|| unrepresentable("symlink target of", entry.path()))?;
            Some(target.to_string())
        } else {
            None
        };

        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt;
            metadata.ino()
        };
        #[cfg(not(unix))]
        let inode = 0;

        Ok(Some(Self {
            path: entry.path().to_path_buf(),
            relative,
            kind,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            inode,
            attrs: FileAttributes::from_metadata(&metadata),
            link_target,
        }))
    }
}

fn unrepresentable(what: &str, path: &Path) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("cannot capture non UTF-8 {what} {}", path.display()),
    )
}

fn relative_string(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Walk a directory tree and collect every entry below `root` (the root
/// itself is not included).
///
/// # Example
/// ```no_run
/// use backup_engine::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let entries = walk_directory(Path::new("/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<ScanEntry>> {
    let mut entries = Vec::new();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let walker = walker
        .into_iter()
        .filter_entry(|e| !should_exclude(e, &options.exclude_names));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if let Some(scan) = ScanEntry::from_entry(&entry, root)? {
            entries.push(scan);
        }
    }

    Ok(entries)
}

/// Total bytes of regular files in a scan
pub fn total_size(entries: &[ScanEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| e.size)
        .sum()
}

/// Check if a directory entry should be excluded by exact name
fn should_exclude(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| n.as_str() == file_name)
}
