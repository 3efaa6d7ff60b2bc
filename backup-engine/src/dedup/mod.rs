//! Dedup Analyzer.
//!
//! Looks at a source's artifacts from the same day and similar size.
//! Byte-identical artifacts are recorded as a [`DedupRecord`] and collapsed
//! into hard links of one canonical copy. Near-duplicates in the same chain
//! are replaced by an rsync delta (`<artifact>.rdelta`) against the older
//! artifact plus a [`DeltaRef`] describing how to rebuild them.
//!
//! Everything here is an optimization: errors are logged and swallowed by
//! [`DedupAnalyzer::apply`], never propagated into a backup run.

pub mod delta;

use crate::config::DedupConfig;
use crate::integrity::{self, ContentHash};
use crate::store::catalog::CatalogEntry;
use crate::store::{StateStore, StoreExt};
use crate::utils::atomic::{temp_path_for, write_atomic, TempFileGuard};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DELTA_EXT: &str = "rdelta";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub content_hash: ContentHash,
    pub canonical_id: String,
    pub canonical_path: PathBuf,
    pub duplicate_ids: Vec<String>,
    pub duplicate_paths: Vec<PathBuf>,
}

/// How to rebuild an artifact whose bytes were replaced by a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRef {
    pub source_id: String,
    pub artifact_id: String,
    pub canonical_id: String,
    pub canonical_hash: ContentHash,
    pub target_hash: ContentHash,
    pub target_size: u64,
    pub delta_path: PathBuf,
    pub delta_hash: ContentHash,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DedupPlan {
    pub duplicates: Vec<DedupRecord>,
    /// (canonical, target) pairs
    pub near_duplicates: Vec<(CatalogEntry, CatalogEntry)>,
}

impl DedupPlan {
    pub fn is_empty(&self) -> bool {
        self.duplicates.is_empty() && self.near_duplicates.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupOutcome {
    pub collapsed: u64,
    pub deltas: u64,
    pub bytes_saved: u64,
}

fn records_ns(source_id: &str) -> String {
    format!("dedup/{source_id}")
}

fn deltas_ns(source_id: &str) -> String {
    format!("dedup/{source_id}/deltas")
}

pub fn delta_path_for(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(DELTA_EXT);
    PathBuf::from(name)
}

pub fn load_delta_ref(store: &dyn StateStore, source_id: &str, artifact_id: &str) -> Result<Option<DeltaRef>> {
    store.load_json(&deltas_ns(source_id), artifact_id)
}

/// Whether some other artifact's delta is based on `artifact_id`.
pub fn is_delta_base(store: &dyn StateStore, source_id: &str, artifact_id: &str) -> Result<bool> {
    let refs: Vec<DeltaRef> = store.load_all(&deltas_ns(source_id))?;
    Ok(refs.iter().any(|r| r.canonical_id == artifact_id))
}

/// Drop the delta file and reference of a pruned artifact.
pub fn forget(store: &dyn StateStore, source_id: &str, artifact_id: &str) -> Result<()> {
    if let Some(delta_ref) = load_delta_ref(store, source_id, artifact_id)? {
        match fs::remove_file(&delta_ref.delta_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        store.delete(&deltas_ns(source_id), artifact_id)?;
    }
    Ok(())
}

/// Rebuild the artifact bytes described by `delta_ref` from its base.
pub fn reconstruct(delta_ref: &DeltaRef, base_path: &Path) -> Result<Vec<u8>> {
    let base = fs::read(base_path)?;
    check(base_path, &base, &delta_ref.canonical_hash)?;
    let delta = fs::read(&delta_ref.delta_path)?;
    check(&delta_ref.delta_path, &delta, &delta_ref.delta_hash)?;

    let bytes = delta::decode(&base, &delta)?;
    check(&delta_ref.delta_path, &bytes, &delta_ref.target_hash)?;
    Ok(bytes)
}

fn check(path: &Path, bytes: &[u8], expected: &ContentHash) -> Result<()> {
    let actual = integrity::hash_bytes(bytes);
    if actual != *expected {
        return Err(EngineError::integrity(path, expected, actual));
    }
    Ok(())
}

pub struct DedupAnalyzer {
    store: Arc<dyn StateStore>,
    settings: DedupConfig,
}

impl DedupAnalyzer {
    pub fn new(store: Arc<dyn StateStore>, settings: DedupConfig) -> Self {
        Self { store, settings }
    }

    /// Find duplicates and near-duplicates among one source's artifacts.
    /// Artifacts whose primary copy is gone or already a delta are ignored.
    pub fn analyze(&self, entries: &[CatalogEntry]) -> Result<DedupPlan> {
        let mut by_day: BTreeMap<NaiveDate, Vec<&CatalogEntry>> = BTreeMap::new();
        for entry in entries {
            if !entry.path().is_file()
                || load_delta_ref(self.store.as_ref(), &entry.artifact.source_id, &entry.artifact.id)?.is_some()
            {
                continue;
            }
            by_day
                .entry(entry.artifact.created_at.date_naive())
                .or_default()
                .push(entry);
        }

        let mut plan = DedupPlan::default();
        for (day, mut group) in by_day {
            group.sort_by_key(|e| (e.artifact.created_at, e.artifact.generation));

            let mut by_hash: BTreeMap<ContentHash, Vec<&CatalogEntry>> = BTreeMap::new();
            for &entry in &group {
                by_hash.entry(entry.artifact.content_hash).or_default().push(entry);
            }

            let mut unique = Vec::new();
            for (hash, same) in by_hash {
                match same.as_slice() {
                    [only] => unique.push(*only),
                    [canonical, rest @ ..] => {
                        debug!("{} artifacts of {} share digest {}", same.len(), day, hash.short());
                        plan.duplicates.push(DedupRecord {
                            content_hash: hash,
                            canonical_id: canonical.artifact.id.clone(),
                            canonical_path: canonical.path(),
                            duplicate_ids: rest.iter().map(|e| e.artifact.id.clone()).collect(),
                            duplicate_paths: rest.iter().map(|e| e.path()).collect(),
                        });
                    }
                    [] => {}
                }
            }

            unique.sort_by_key(|e| (e.artifact.created_at, e.artifact.generation));
            let mut targets: Vec<&str> = Vec::new();
            for (i, target) in unique.iter().enumerate() {
                let canonical = unique[..i].iter().rev().find(|base| {
                    base.artifact.baseline == target.artifact.baseline
                        && !targets.contains(&base.artifact.id.as_str())
                        && self.similar_size(base.artifact.size_bytes, target.artifact.size_bytes)
                });
                if let Some(canonical) = canonical {
                    targets.push(&target.artifact.id);
                    plan.near_duplicates.push(((*canonical).clone(), (*target).clone()));
                }
            }
        }
        Ok(plan)
    }

    fn similar_size(&self, a: u64, b: u64) -> bool {
        if a > self.settings.max_delta_bytes || b > self.settings.max_delta_bytes {
            return false;
        }
        let larger = a.max(b) as f64;
        larger == 0.0 || (a.abs_diff(b) as f64 / larger) <= self.settings.size_tolerance
    }

    /// Carry out a plan. Near-duplicates are only replaced once
    /// `is_resolved` confirms every required destination holds the full
    /// artifact.
    pub fn apply(&self, source_id: &str, plan: &DedupPlan, is_resolved: &dyn Fn(&CatalogEntry) -> bool) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();

        for record in &plan.duplicates {
            if let Err(e) = self.store.save_json(&records_ns(source_id), &record.content_hash.to_hex(), record) {
                warn!(source = %source_id, "Could not record duplicate set: {}", e);
            }
            match collapse(record) {
                Ok(saved) => {
                    outcome.collapsed += record.duplicate_paths.len() as u64;
                    outcome.bytes_saved += saved;
                }
                Err(e) => warn!(source = %source_id, "Dedup of {} skipped: {}", record.canonical_id, e),
            }
        }

        for (canonical, target) in &plan.near_duplicates {
            if !is_resolved(target) {
                debug!(artifact = %target.artifact.id, "Delivery unresolved, keeping full copy");
                continue;
            }
            match self.replace_with_delta(canonical, target) {
                Ok(Some(saved)) => {
                    outcome.deltas += 1;
                    outcome.bytes_saved += saved;
                }
                Ok(None) => {}
                Err(e) => warn!(artifact = %target.artifact.id, "Delta against {} skipped: {}", canonical.artifact.id, e),
            }
        }

        if outcome.collapsed + outcome.deltas > 0 {
            info!(
                source = %source_id,
                "Dedup collapsed {} duplicate(s), stored {} delta(s), saved {} bytes",
                outcome.collapsed,
                outcome.deltas,
                outcome.bytes_saved
            );
        }
        outcome
    }

    /// Store `target` as a delta against `canonical`. Returns the bytes
    /// saved, or `None` when the delta would not be worth it.
    pub fn replace_with_delta(&self, canonical: &CatalogEntry, target: &CatalogEntry) -> Result<Option<u64>> {
        let base = fs::read(canonical.path())?;
        check(&canonical.path(), &base, &canonical.artifact.content_hash)?;
        let target_path = target.path();
        let target_bytes = fs::read(&target_path)?;
        check(&target_path, &target_bytes, &target.artifact.content_hash)?;

        let encoded = delta::encode(&base, &target_bytes, delta::DEFAULT_BLOCK_SIZE)?;
        let ratio = delta::delta_ratio(encoded.len(), target_bytes.len());
        if ratio > self.settings.max_delta_ratio {
            debug!(artifact = %target.artifact.id, "Delta ratio {:.2} too high", ratio);
            return Ok(None);
        }
        if delta::decode(&base, &encoded)? != target_bytes {
            return Err(EngineError::Delta(format!(
                "delta for {} does not reproduce the artifact",
                target.artifact.id
            )));
        }

        let delta_path = delta_path_for(&target_path);
        write_atomic(&delta_path, &encoded)?;
        let delta_ref = DeltaRef {
            source_id: target.artifact.source_id.clone(),
            artifact_id: target.artifact.id.clone(),
            canonical_id: canonical.artifact.id.clone(),
            canonical_hash: canonical.artifact.content_hash,
            target_hash: target.artifact.content_hash,
            target_size: target_bytes.len() as u64,
            delta_path,
            delta_hash: integrity::hash_bytes(&encoded),
            created_at: Utc::now(),
        };
        self.store
            .save_json(&deltas_ns(&target.artifact.source_id), &target.artifact.id, &delta_ref)?;
        fs::remove_file(&target_path)?;

        info!(
            artifact = %target.artifact.id,
            "Replaced by {} byte delta against {}",
            encoded.len(),
            canonical.artifact.id
        );
        Ok(Some((target_bytes.len() - encoded.len()) as u64))
    }
}

/// Replace each duplicate with a hard link to the canonical file.
fn collapse(record: &DedupRecord) -> Result<u64> {
    let mut saved = 0;
    let canonical_meta = fs::metadata(&record.canonical_path)?;

    for dup in &record.duplicate_paths {
        let dup_meta = fs::metadata(dup)?;
        if same_file(&canonical_meta, &dup_meta) {
            continue;
        }
        integrity::ensure_matches(dup, &record.content_hash)?;

        let guard = TempFileGuard::new(temp_path_for(dup));
        fs::hard_link(&record.canonical_path, guard.path())?;
        guard.commit_replace(dup)?;
        saved += dup_meta.len();
    }
    Ok(saved)
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_a: &fs::Metadata, _b: &fs::Metadata) -> bool {
    false
}
