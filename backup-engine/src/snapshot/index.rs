//! Change index: the per-entry identity table an incremental run diffs against.

use crate::fs::walker::{EntryKind, ScanEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Identity of one entry as of the last committed capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub inode: u64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl IndexEntry {
    fn from_scan(entry: &ScanEntry) -> Self {
        Self {
            kind: entry.kind,
            size: entry.size,
            mtime_secs: entry.attrs.mtime_secs,
            mtime_nanos: entry.attrs.mtime_nanos,
            inode: entry.inode,
            mode: entry.attrs.mode,
            link_target: entry.link_target.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeIndex {
    pub entries: BTreeMap<String, IndexEntry>,
}

impl ChangeIndex {
    pub fn from_scan(scan: &[ScanEntry]) -> Self {
        Self {
            entries: scan
                .iter()
                .map(|e| (e.relative.clone(), IndexEntry::from_scan(e)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entries to capture and paths to remove, relative to a change index.
#[derive(Debug, Default)]
pub struct Delta {
    /// Indices into the scan of new or modified entries
    pub changed: Vec<usize>,
    /// Paths that vanished (or changed kind) since the index was taken
    pub removed: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Compare a fresh scan against the committed index.
///
/// Files count as changed when size, mtime, inode or mode differ. Directories
/// are re-captured when their mode or mtime changed (they carry no content).
/// Symlinks are compared by target as well.
pub fn compute_delta(index: &ChangeIndex, scan: &[ScanEntry]) -> Delta {
    let mut delta = Delta::default();
    let mut seen = HashSet::with_capacity(scan.len());

    for (i, entry) in scan.iter().enumerate() {
        seen.insert(entry.relative.as_str());
        let current = IndexEntry::from_scan(entry);

        match index.entries.get(&entry.relative) {
            None => delta.changed.push(i),
            Some(previous) if previous.kind != current.kind => {
                delta.removed.push(entry.relative.clone());
                delta.changed.push(i);
            }
            Some(previous) => {
                let modified = match current.kind {
                    EntryKind::File => {
                        previous.size != current.size
                            || previous.mtime_secs != current.mtime_secs
                            || previous.mtime_nanos != current.mtime_nanos
                            || previous.inode != current.inode
                            || previous.mode != current.mode
                    }
                    EntryKind::Dir => {
                        previous.mode != current.mode
                            || previous.mtime_secs != current.mtime_secs
                            || previous.mtime_nanos != current.mtime_nanos
                    }
                    EntryKind::Symlink => {
                        previous.link_target != current.link_target
                            || previous.inode != current.inode
                    }
                };
                if modified {
                    delta.changed.push(i);
                }
            }
        }
    }

    delta.removed.extend(
        index
            .entries
            .keys()
            .filter(|path| !seen.contains(path.as_str()))
            .cloned(),
    );

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::walker::{walk_directory, WalkOptions};
    use std::fs;
    use tempfile::TempDir;

    fn scan(dir: &TempDir) -> Vec<ScanEntry> {
        walk_directory(dir.path(), &WalkOptions::default()).unwrap()
    }

    #[test]
    fn test_unchanged_tree_yields_empty_delta() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.txt"), b"alpha").unwrap();

        let entries = scan(&dir);
        let index = ChangeIndex::from_scan(&entries);

        assert!(compute_delta(&index, &scan(&dir)).is_empty());
    }

    #[test]
    fn test_detects_new_modified_and_removed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), b"same").unwrap();
        fs::write(dir.path().join("edit.txt"), b"before").unwrap();
        fs::write(dir.path().join("gone.txt"), b"bye").unwrap();
        let index = ChangeIndex::from_scan(&scan(&dir));

        fs::write(dir.path().join("edit.txt"), b"after, and longer").unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        fs::write(dir.path().join("new.txt"), b"hello").unwrap();

        let entries = scan(&dir);
        let delta = compute_delta(&index, &entries);
        let changed: Vec<_> = delta.changed.iter().map(|&i| entries[i].relative.as_str()).collect();

        assert_eq!(changed, vec!["edit.txt", "new.txt"]);
        assert_eq!(delta.removed, vec!["gone.txt"]);
    }

    #[test]
    fn test_kind_change_is_remove_plus_add() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("thing"), b"file").unwrap();
        let index = ChangeIndex::from_scan(&scan(&dir));

        fs::remove_file(dir.path().join("thing")).unwrap();
        fs::create_dir(dir.path().join("thing")).unwrap();

        let entries = scan(&dir);
        let delta = compute_delta(&index, &entries);
        assert_eq!(delta.removed, vec!["thing"]);
        assert_eq!(delta.changed.len(), 1);
    }

    #[test]
    fn test_mtime_only_change_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("touched.txt");
        fs::write(&path, b"content").unwrap();
        let index = ChangeIndex::from_scan(&scan(&dir));

        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000))
            .unwrap();

        assert_eq!(compute_delta(&index, &scan(&dir)).changed.len(), 1);
    }
}
