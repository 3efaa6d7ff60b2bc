//! Restore: rebuild a source tree from its baseline and incrementals.
//!
//! Each artifact of the chain is located on any reachable root (the primary
//! it was committed to, then mirrors and vaults), verified against its
//! catalog digest, and extracted in order into the target directory. An
//! artifact that was replaced by a dedup delta is reconstructed from its
//! canonical copy first.

use crate::archive::pack::{Archiver, PackArchiver, PackReader, PackRecord};
use crate::dedup;
use crate::fs::metadata::FileAttributes;
use crate::integrity::{self, ContentHash};
use crate::storage::StorageBackend;
use crate::store::catalog::{ArtifactCatalog, CatalogEntry};
use crate::store::StateStore;
use crate::utils::atomic::{temp_path_for, TempFileGuard};
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    /// Artifacts applied, oldest first
    pub artifacts: Vec<String>,
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub removed: u64,
    pub bytes: u64,
}

pub struct Restorer {
    store: Arc<dyn StateStore>,
    catalog: ArtifactCatalog,
    roots: Vec<Arc<dyn StorageBackend>>,
}

impl Restorer {
    /// `roots` are searched in order after an artifact's own primary root.
    pub fn new(store: Arc<dyn StateStore>, roots: Vec<Arc<dyn StorageBackend>>) -> Self {
        Self {
            catalog: ArtifactCatalog::new(Arc::clone(&store)),
            store,
            roots,
        }
    }

    /// Restore `artifact_id` (latest when `None`) of `source_id` into
    /// `target`, which must be absent or empty.
    pub fn restore(
        &self,
        source_id: &str,
        artifact_id: Option<&str>,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<RestoreSummary> {
        let artifact_id = match artifact_id {
            Some(id) => id.to_string(),
            None => self
                .catalog
                .latest(source_id)?
                .map(|e| e.artifact.id)
                .ok_or_else(|| EngineError::Config(format!("no artifacts recorded for '{source_id}'")))?,
        };

        if target.exists() && fs::read_dir(target)?.next().is_some() {
            return Err(EngineError::Config(format!(
                "restore target {} is not empty",
                target.display()
            )));
        }
        fs::create_dir_all(target)?;

        let chain = self.catalog.chain_to(source_id, &artifact_id)?;
        info!(
            source = %source_id,
            artifact = %artifact_id,
            "Restoring chain of {} artifact(s) into {}",
            chain.len(),
            target.display()
        );

        let mut summary = RestoreSummary::default();
        for entry in &chain {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let input = self.open_verified(entry)?;
            let archiver = PackArchiver::for_extension(&entry.artifact.name()?.extension)?;
            let reader = archiver.open(input)?;
            extract_pack(reader, target, &mut summary)?;
            summary.artifacts.push(entry.artifact.id.clone());
        }

        info!(
            source = %source_id,
            "Restored {} files, {} dirs, {} symlinks ({} bytes), {} removals",
            summary.files,
            summary.dirs,
            summary.symlinks,
            summary.bytes,
            summary.removed
        );
        Ok(summary)
    }

    /// Path of a copy of `entry` whose digest matches the catalog.
    pub fn locate(&self, entry: &CatalogEntry) -> Result<Option<PathBuf>> {
        let expected = &entry.artifact.content_hash;
        let mut candidates = vec![entry.path()];
        for root in &self.roots {
            if root.is_available() {
                let path = root.resolve(&entry.rel_path);
                if !candidates.contains(&path) {
                    candidates.push(path);
                }
            }
        }

        let mut mismatch = None;
        for path in candidates {
            if !path.is_file() {
                continue;
            }
            let actual = integrity::hash_file(&path)?;
            if actual == *expected {
                return Ok(Some(path));
            }
            warn!(
                artifact = %entry.artifact.id,
                "Copy at {} does not match its digest ({} != {})",
                path.display(),
                actual.short(),
                expected.short()
            );
            mismatch = Some(EngineError::integrity(&path, expected, actual));
        }

        match mismatch {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    fn open_verified(&self, entry: &CatalogEntry) -> Result<Box<dyn Read>> {
        let located = match self.locate(entry) {
            Ok(found) => found,
            // A corrupt copy is still fatal unless a delta can stand in
            Err(err) => match self.reconstruct(entry)? {
                Some(bytes) => return Ok(Box::new(Cursor::new(bytes))),
                None => return Err(err),
            },
        };

        if let Some(path) = located {
            return Ok(Box::new(BufReader::new(File::open(path)?)));
        }
        if let Some(bytes) = self.reconstruct(entry)? {
            return Ok(Box::new(Cursor::new(bytes)));
        }

        Err(EngineError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no reachable copy of artifact {}", entry.artifact.id),
        )))
    }

    /// Rebuild an artifact that dedup replaced with a delta.
    fn reconstruct(&self, entry: &CatalogEntry) -> Result<Option<Vec<u8>>> {
        let Some(delta_ref) = dedup::load_delta_ref(self.store.as_ref(), &entry.artifact.source_id, &entry.artifact.id)?
        else {
            return Ok(None);
        };
        let canonical = self
            .catalog
            .get(&entry.artifact.source_id, &delta_ref.canonical_id)?
            .ok_or_else(|| {
                EngineError::StateConflict(format!(
                    "delta base {} of {} is not in the catalog",
                    delta_ref.canonical_id, entry.artifact.id
                ))
            })?;
        let Some(base_path) = self.locate(&canonical)? else {
            return Ok(None);
        };

        let bytes = dedup::reconstruct(&delta_ref, &base_path)?;
        verify_bytes(&entry.artifact.id, &bytes, &entry.artifact.content_hash)?;
        info!(artifact = %entry.artifact.id, "Reconstructed from delta against {}", canonical.artifact.id);
        Ok(Some(bytes))
    }
}

fn verify_bytes(label: &str, bytes: &[u8], expected: &ContentHash) -> Result<()> {
    let actual = integrity::hash_bytes(bytes);
    if actual != *expected {
        return Err(EngineError::integrity(label, expected, actual));
    }
    Ok(())
}

/// Join a pack path onto `root`, refusing absolute paths, `..`, and any
/// path whose already-restored parent is a symlink.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if relative.is_empty() {
        return Err(EngineError::Archive("empty path in pack".into()));
    }
    let mut joined = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                if joined != root && joined.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                    return Err(EngineError::Archive(format!(
                        "pack path {relative} passes through symlink {}",
                        joined.display()
                    )));
                }
                joined.push(part)
            }
            Component::CurDir => {}
            _ => {
                return Err(EngineError::Archive(format!(
                    "unsafe path in pack: {relative}"
                )))
            }
        }
    }
    Ok(joined)
}

/// Apply one pack's records on top of `target`.
pub fn extract_pack<R: Read>(mut reader: PackReader<R>, target: &Path, summary: &mut RestoreSummary) -> Result<()> {
    // Directory attributes are applied last, deepest first, so that writing
    // children does not disturb their mtimes.
    let mut dir_attrs: Vec<(PathBuf, FileAttributes)> = Vec::new();

    while let Some(record) = reader.next_record()? {
        match record {
            PackRecord::Removed { path } => {
                let dest = safe_join(target, &path)?;
                remove_existing(&dest)?;
                summary.removed += 1;
            }
            PackRecord::Dir { path, attrs } => {
                let dest = safe_join(target, &path)?;
                if dest.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                    remove_existing(&dest)?;
                }
                fs::create_dir_all(&dest)?;
                dir_attrs.push((dest, attrs));
                summary.dirs += 1;
            }
            PackRecord::File { path, attrs, .. } => {
                let dest = safe_join(target, &path)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                if dest.symlink_metadata().is_ok_and(|m| m.is_dir()) {
                    remove_existing(&dest)?;
                }

                let guard = TempFileGuard::new(temp_path_for(&dest));
                let file = OpenOptions::new().write(true).create_new(true).open(guard.path())?;
                let mut writer = BufWriter::new(file);
                summary.bytes += reader.copy_content(&mut writer)?;
                writer.flush()?;
                drop(writer);
                guard.commit_replace(&dest)?;
                attrs.apply_to_path(&dest)?;
                summary.files += 1;
            }
            PackRecord::Symlink { path, target: link } => {
                let dest = safe_join(target, &path)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                remove_existing(&dest)?;
                create_symlink(&link, &dest)?;
                summary.symlinks += 1;
            }
            PackRecord::End { .. } => break,
        }
    }

    dir_attrs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, attrs) in dir_attrs {
        attrs.apply_to_path(&path)?;
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot restore symlink {}", link.display()),
    ))
}
