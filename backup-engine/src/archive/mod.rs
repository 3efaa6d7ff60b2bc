//! Archive Builder.
//!
//! One build is a straight pipeline:
//!
//! ```text
//! SELECT_MODE -> CAPTURE -> COMPRESS -> HASH -> ATOMIC_COMMIT -> SUCCESS | FAILED
//! ```
//!
//! The pack is streamed into a hidden temporary file in the destination
//! directory while being hashed, synced, re-hashed from disk, and only then
//! renamed to its final name. Snapshot state is committed last, so any
//! failure before the rename leaves neither an artifact nor a moved
//! baseline behind.

pub mod naming;
pub mod pack;
pub mod restore;

use crate::config::SourceConfig;
use crate::fs::walker::{walk_directory, ScanEntry, WalkOptions};
use crate::integrity::{self, ContentHash, HashingWriter};
use crate::snapshot::{compute_delta, ChangeIndex, SnapshotTracker};
use crate::storage::StorageBackend;
use crate::store::catalog::{artifact_rel_path, ArtifactCatalog, CatalogEntry};
use crate::store::ledger::{DeliveryLedger, PendingMirror};
use crate::store::StateStore;
use crate::utils::atomic::{temp_path_for, write_atomic, TempFileGuard};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use naming::{ArtifactKind, ArtifactName};
use pack::{Archiver, PackHeader, PackInput, PackStats};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const META_SIDECAR_EXT: &str = "meta.json";

/// One committed archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// File name, identical on every destination
    pub id: String,
    pub kind: ArtifactKind,
    pub source_id: String,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub generation: u64,
    /// Id of the full artifact heading this artifact's chain (own id for a full)
    pub baseline: String,
    /// Artifact this one is a delta of
    pub parent: Option<String>,
    pub stats: PackStats,
}

impl BackupArtifact {
    pub fn name(&self) -> Result<ArtifactName> {
        ArtifactName::parse(&self.id)
    }

    pub fn rel_path(&self) -> String {
        artifact_rel_path(&self.source_id, &self.id)
    }
}

/// `<artifact>.meta.json`
pub fn meta_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(META_SIDECAR_EXT);
    PathBuf::from(name)
}

pub fn write_meta(artifact_path: &Path, artifact: &BackupArtifact) -> Result<()> {
    write_atomic(&meta_path(artifact_path), &serde_json::to_vec_pretty(artifact)?)
}

pub fn read_meta(artifact_path: &Path) -> Result<BackupArtifact> {
    Ok(serde_json::from_slice(&fs::read(meta_path(artifact_path))?)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    SelectMode,
    Capture,
    Compress,
    Hash,
    AtomicCommit,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::SelectMode => "SELECT_MODE",
            BuildStage::Capture => "CAPTURE",
            BuildStage::Compress => "COMPRESS",
            BuildStage::Hash => "HASH",
            BuildStage::AtomicCommit => "ATOMIC_COMMIT",
        };
        f.write_str(name)
    }
}

pub struct ArchiveBuilder {
    tracker: SnapshotTracker,
    catalog: ArtifactCatalog,
    ledger: DeliveryLedger,
    archiver: Arc<dyn Archiver>,
    host: String,
    mirror_ids: Vec<String>,
}

impl ArchiveBuilder {
    pub fn new(store: Arc<dyn StateStore>, archiver: Arc<dyn Archiver>, host: &str) -> Self {
        Self {
            tracker: SnapshotTracker::new(Arc::clone(&store)),
            catalog: ArtifactCatalog::new(Arc::clone(&store)),
            ledger: DeliveryLedger::new(store),
            archiver,
            host: host.to_string(),
            mirror_ids: Vec::new(),
        }
    }

    /// Mirrors every committed artifact owes a delivery to. A pending marker
    /// for each is in place before the artifact is, so a run killed between
    /// commit and replication still leaves the delivery queued.
    pub fn with_mirrors(mut self, mirror_ids: Vec<String>) -> Self {
        self.mirror_ids = mirror_ids;
        self
    }

    /// Run one build of `source` into `destination`.
    pub fn build(
        &self,
        source: &SourceConfig,
        kind: ArtifactKind,
        destination: &dyn StorageBackend,
        cancel: &CancellationToken,
    ) -> Result<CatalogEntry> {
        // SELECT_MODE
        stage(&source.id, BuildStage::SelectMode);
        let state = match kind {
            ArtifactKind::Full => self.tracker.reset_baseline(&source.id),
            ArtifactKind::Incremental => self.tracker.next_state(&source.id)?,
        };

        // CAPTURE
        stage(&source.id, BuildStage::Capture);
        if !source.path.is_dir() {
            return Err(EngineError::Config(format!(
                "source '{}' path {} is not a directory",
                source.id,
                source.path.display()
            )));
        }
        let scan = walk_directory(
            &source.path,
            &WalkOptions {
                exclude_names: source.exclude.clone(),
                ..WalkOptions::default()
            },
        )?;
        let (entries, removed): (Vec<&ScanEntry>, Vec<String>) = match kind {
            ArtifactKind::Full => (scan.iter().collect(), Vec::new()),
            ArtifactKind::Incremental => {
                let delta = compute_delta(&state.change_index, &scan);
                (delta.changed.iter().map(|&i| &scan[i]).collect(), delta.removed)
            }
        };
        info!(
            source = %source.id,
            "Captured {} of {} entries, {} removals",
            entries.len(),
            scan.len(),
            removed.len()
        );

        // COMPRESS
        stage(&source.id, BuildStage::Compress);
        let mut created_at = Utc::now();
        // Names carry milliseconds; step past a same-millisecond predecessor
        while destination.exists(&artifact_rel_path(
            &source.id,
            &ArtifactName::new(kind, created_at, &self.host, self.archiver.extension()).to_string(),
        ))? {
            created_at += chrono::Duration::milliseconds(1);
        }
        let id = ArtifactName::new(kind, created_at, &self.host, self.archiver.extension()).to_string();
        let rel_path = artifact_rel_path(&source.id, &id);
        let final_path = destination.resolve(&rel_path);
        let dir = final_path
            .parent()
            .ok_or_else(|| EngineError::Archive(format!("artifact path {} has no parent", final_path.display())))?;
        fs::create_dir_all(dir)?;

        let (baseline, parent) = match kind {
            ArtifactKind::Full => (None, None),
            ArtifactKind::Incremental => (state.baseline.clone(), state.last_artifact.clone()),
        };
        let header = PackHeader::new(
            kind,
            &source.id,
            state.generation,
            baseline.clone(),
            parent.clone(),
            &self.host,
            created_at,
        );

        let guard = TempFileGuard::new(temp_path_for(&final_path));
        let file = OpenOptions::new().write(true).create_new(true).open(guard.path())?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        let stats = self.archiver.write_pack(
            &PackInput {
                header,
                entries,
                removed: &removed,
            },
            &mut writer,
            cancel,
        )?;
        writer.flush()?;
        let (buffered, streamed_hash, size_bytes) = writer.finish();
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        // HASH
        stage(&source.id, BuildStage::Hash);
        integrity::ensure_matches(guard.path(), &streamed_hash)?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // ATOMIC_COMMIT
        stage(&source.id, BuildStage::AtomicCommit);
        self.queue_deliveries(&source.id, &id, &final_path, &streamed_hash)?;
        if let Err(e) = guard.commit(&final_path) {
            for mirror_id in &self.mirror_ids {
                if let Err(clear) = self.ledger.clear_pending(&source.id, &id, mirror_id) {
                    warn!(artifact = %id, "Could not drop pending marker for '{}': {}", mirror_id, clear);
                }
            }
            return Err(e);
        }

        let artifact = BackupArtifact {
            id: id.clone(),
            kind,
            source_id: source.id.clone(),
            content_hash: streamed_hash,
            size_bytes,
            created_at,
            host: self.host.clone(),
            generation: state.generation,
            baseline: baseline.unwrap_or_else(|| id.clone()),
            parent,
            stats,
        };
        let entry = CatalogEntry {
            artifact: artifact.clone(),
            root_id: destination.id().to_string(),
            root: destination.root().to_path_buf(),
            rel_path,
        };

        self.finish_commit(&final_path, &entry).map_err(|e| match e {
            EngineError::Commit { .. } => e,
            other => EngineError::Commit {
                path: final_path.clone(),
                source: std::io::Error::other(other.to_string()),
            },
        })?;

        let mut next = state;
        next.change_index = ChangeIndex::from_scan(&scan);
        next.last_artifact = Some(id.clone());
        next.baseline = Some(artifact.baseline.clone());
        next.committed_at = Some(Utc::now());
        self.tracker.commit(&source.id, next)?;

        info!(
            source = %source.id,
            artifact = %id,
            "Committed {} artifact ({} bytes, {} files, sha256 {})",
            kind,
            size_bytes,
            artifact.stats.files,
            artifact.content_hash.short()
        );
        Ok(entry)
    }

    fn queue_deliveries(&self, source_id: &str, artifact_id: &str, path: &Path, hash: &ContentHash) -> Result<()> {
        let now = Utc::now();
        for mirror_id in &self.mirror_ids {
            self.ledger.mark_pending(PendingMirror {
                source_id: source_id.to_string(),
                artifact_id: artifact_id.to_string(),
                mirror_id: mirror_id.clone(),
                primary_path: path.to_path_buf(),
                content_hash: *hash,
                attempts: 0,
                last_error: "awaiting first delivery".into(),
                since: now,
                last_attempt: now,
            })?;
        }
        Ok(())
    }

    /// Sidecars and catalog record for an artifact already renamed into place.
    fn finish_commit(&self, final_path: &Path, entry: &CatalogEntry) -> Result<()> {
        integrity::write_sidecar(final_path, &entry.artifact.content_hash)?;
        write_meta(final_path, &entry.artifact)?;
        self.catalog.insert(entry)
    }
}

fn stage(source_id: &str, stage: BuildStage) {
    debug!(source = %source_id, stage = %stage, "Build stage");
}
