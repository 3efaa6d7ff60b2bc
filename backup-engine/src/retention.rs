//! Retention Manager.
//!
//! Artifacts are pruned a chain at a time (a baseline with its
//! incrementals), never individually: an incremental is useless without
//! its predecessors. A chain survives while it is among the newest
//! `keep_count`, while the snapshot tracker still extends it, while its
//! newest member is younger than `keep_days`, and while any member lacks a
//! verified delivery to every mirror and every handoff importer.

use crate::config::{DedupConfig, RetentionConfig};
use crate::dedup::{self, DedupAnalyzer, DedupOutcome};
use crate::handoff::{prune_medium, require_medium};
use crate::integrity;
use crate::replication::delivery::delivery_sidecar_rel;
use crate::snapshot::SnapshotTracker;
use crate::storage::StorageBackend;
use crate::store::catalog::{artifact_rel_path, ArtifactCatalog, CatalogEntry};
use crate::store::ledger::{DeliveryLedger, PendingMirror};
use crate::store::{StateStore, StoreExt};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const STATUS_NS: &str = "status";
const STAMP_NAME: &str = "retention";

fn backlog_ns(source_id: &str) -> String {
    format!("mirror-prune/{source_id}")
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub pruned: Vec<String>,
    pub kept: usize,
    /// (artifact, reason) for chains old enough to go but not resolved
    pub blocked: Vec<(String, String)>,
    /// (artifact, mirror) copies that failed re-verification
    pub reverify_failures: Vec<(String, String)>,
    pub medium_pruned: Vec<String>,
    /// (artifact, mirror) copies removed from a mirror
    #[serde(default)]
    pub mirror_pruned: Vec<(String, String)>,
    pub dedup: DedupOutcome,
}

/// Copies of a pruned artifact left on mirrors that were unplugged at the
/// time. Drained on every pass until empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MirrorBacklog {
    rel_path: String,
    mirrors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetentionStamp {
    last_run: DateTime<Utc>,
    pruned: usize,
}

pub struct RetentionManager {
    store: Arc<dyn StateStore>,
    catalog: ArtifactCatalog,
    ledger: DeliveryLedger,
    tracker: SnapshotTracker,
    settings: RetentionConfig,
    mirrors: Vec<Arc<dyn StorageBackend>>,
    importers: Vec<String>,
    medium: Option<Arc<dyn StorageBackend>>,
    dedup: Option<DedupAnalyzer>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn StateStore>, settings: RetentionConfig, mirrors: Vec<Arc<dyn StorageBackend>>) -> Self {
        Self {
            catalog: ArtifactCatalog::new(Arc::clone(&store)),
            ledger: DeliveryLedger::new(Arc::clone(&store)),
            tracker: SnapshotTracker::new(Arc::clone(&store)),
            store,
            settings,
            mirrors,
            importers: Vec::new(),
            medium: None,
            dedup: None,
        }
    }

    /// Require acknowledgements from `importers` and prune the medium.
    pub fn with_handoff(mut self, medium: Option<Arc<dyn StorageBackend>>, importers: Vec<String>) -> Self {
        self.medium = medium;
        self.importers = importers;
        self
    }

    pub fn with_dedup(mut self, settings: DedupConfig) -> Self {
        if settings.enabled {
            self.dedup = Some(DedupAnalyzer::new(Arc::clone(&self.store), settings));
        }
        self
    }

    pub fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .load_json::<RetentionStamp>(STATUS_NS, STAMP_NAME)?
            .map(|s| s.last_run))
    }

    /// Whether an automatic pass is due after a backup.
    pub fn is_due(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(match self.last_run()? {
            Some(last) => now - last >= Duration::hours(self.settings.auto_interval_hours as i64),
            None => true,
        })
    }

    /// One retention pass over `source_ids`.
    pub fn run(&self, source_ids: &[String], now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        for source_id in source_ids {
            if self.settings.reverify_mirrors {
                let failures = self.reverify(source_id)?;
                report.reverify_failures.extend(failures);
            }
            self.drain_mirror_backlog(source_id, &mut report)?;
            self.prune_source(source_id, now, &mut report)?;
            self.run_dedup(source_id, &mut report);
        }

        if let Some(medium) = &self.medium {
            if !self.importers.is_empty() {
                match require_medium(medium.as_ref()) {
                    Ok(()) => {
                        report.medium_pruned =
                            prune_medium(medium.as_ref(), &self.catalog, &self.ledger, &self.importers)?
                    }
                    Err(e) => info!("Handoff medium not pruned: {}", e),
                }
            }
        }

        self.store.save_json(
            STATUS_NS,
            STAMP_NAME,
            &RetentionStamp {
                last_run: now,
                pruned: report.pruned.len(),
            },
        )?;

        info!(
            "Retention pass: {} pruned, {} kept, {} blocked, {} removed from medium",
            report.pruned.len(),
            report.kept,
            report.blocked.len(),
            report.medium_pruned.len()
        );
        Ok(report)
    }

    fn prune_source(&self, source_id: &str, now: DateTime<Utc>, report: &mut RetentionReport) -> Result<()> {
        let chains = self.catalog.chains(source_id)?;
        let current_baseline = self.tracker.current(source_id)?.and_then(|s| s.baseline);
        let max_age = Duration::days(self.settings.keep_days as i64);
        let total = chains.len();

        for (index, chain) in chains.iter().enumerate() {
            let Some(head) = chain.first() else {
                continue;
            };
            let newest_rank = total - 1 - index;
            if newest_rank < self.settings.keep_count {
                report.kept += chain.len();
                continue;
            }
            if current_baseline.as_deref() == Some(head.artifact.baseline.as_str()) {
                debug!(source = %source_id, "Chain {} is still being extended", head.artifact.baseline);
                report.kept += chain.len();
                continue;
            }
            let newest = chain
                .iter()
                .map(|e| e.artifact.created_at)
                .max()
                .unwrap_or(head.artifact.created_at);
            if now - newest < max_age {
                report.kept += chain.len();
                continue;
            }

            if let Some((artifact, reason)) = self.first_unresolved(chain)? {
                warn!(
                    source = %source_id,
                    artifact = %artifact,
                    "Chain {} is past retention but not prunable: {}",
                    head.artifact.baseline,
                    reason
                );
                report.blocked.push((artifact, reason));
                report.kept += chain.len();
                continue;
            }

            // Newest first, so a delta inside the chain goes before its base
            for entry in chain.iter().rev() {
                if dedup::is_delta_base(self.store.as_ref(), source_id, entry.id())? {
                    report
                        .blocked
                        .push((entry.id().to_string(), "base of a stored delta".into()));
                    report.kept += 1;
                    continue;
                }
                match self.prune_artifact(entry, report) {
                    Ok(()) => report.pruned.push(entry.id().to_string()),
                    Err(e) => {
                        error!(artifact = %entry.id(), "Prune failed: {}", e);
                        report.blocked.push((entry.id().to_string(), e.to_string()));
                        report.kept += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn first_unresolved(&self, chain: &[CatalogEntry]) -> Result<Option<(String, String)>> {
        for entry in chain {
            if let Some(reason) = self.unresolved_reason(entry)? {
                return Ok(Some((entry.id().to_string(), reason)));
            }
        }
        Ok(None)
    }

    /// `None` once every required destination holds a verified copy.
    ///
    /// A mirror with neither a record nor a pending marker (e.g. configured
    /// after the artifact was made) is queued so a later run delivers it.
    pub fn unresolved_reason(&self, entry: &CatalogEntry) -> Result<Option<String>> {
        let source_id = &entry.artifact.source_id;
        let artifact_id = entry.id();
        let hash = &entry.artifact.content_hash;

        let pending = self.ledger.pending_for(source_id, artifact_id)?;
        if let Some(marker) = pending.first() {
            return Ok(Some(format!("mirror '{}' pending: {}", marker.mirror_id, marker.last_error)));
        }

        for mirror in &self.mirrors {
            if !self.ledger.is_delivered(source_id, artifact_id, mirror.id(), hash)? {
                self.queue_mirror(entry, mirror.id(), "no verified delivery record")?;
                return Ok(Some(format!("no verified delivery to mirror '{}'", mirror.id())));
            }
        }
        for importer in &self.importers {
            if !self.ledger.is_delivered(source_id, artifact_id, importer, hash)? {
                return Ok(Some(format!("not acknowledged by importer '{importer}'")));
            }
        }
        Ok(None)
    }

    fn queue_mirror(&self, entry: &CatalogEntry, mirror_id: &str, reason: &str) -> Result<()> {
        let now = Utc::now();
        self.ledger.mark_pending(PendingMirror {
            source_id: entry.artifact.source_id.clone(),
            artifact_id: entry.artifact.id.clone(),
            mirror_id: mirror_id.to_string(),
            primary_path: entry.path(),
            content_hash: entry.artifact.content_hash,
            attempts: 0,
            last_error: reason.to_string(),
            since: now,
            last_attempt: now,
        })
    }

    /// Re-hash mirror copies the ledger claims are delivered. A mismatch is
    /// an integrity failure of that copy: the record is revoked and the
    /// mirror goes back to pending.
    pub fn reverify(&self, source_id: &str) -> Result<Vec<(String, String)>> {
        let mut failures = Vec::new();
        for entry in self.catalog.list(source_id)? {
            let deliveries = self.ledger.deliveries(source_id, entry.id())?;
            for mirror in &self.mirrors {
                if !deliveries.contains_key(mirror.id()) || !mirror.is_available() {
                    continue;
                }
                let rel = artifact_rel_path(source_id, entry.id());
                let actual = if mirror.exists(&rel)? {
                    Some(mirror.hash(&rel)?)
                } else {
                    None
                };
                if actual == Some(entry.artifact.content_hash) {
                    continue;
                }

                let err = EngineError::integrity(
                    mirror.resolve(&rel),
                    entry.artifact.content_hash,
                    actual.map(|h| h.to_hex()).unwrap_or_else(|| "missing".into()),
                );
                error!(artifact = %entry.id(), "Mirror '{}' copy failed re-verification: {}", mirror.id(), err);
                self.ledger.revoke(source_id, entry.id(), mirror.id())?;
                self.queue_mirror(&entry, mirror.id(), &err.to_string())?;
                failures.push((entry.id().to_string(), mirror.id().to_string()));
            }
        }
        Ok(failures)
    }

    fn prune_artifact(&self, entry: &CatalogEntry, report: &mut RetentionReport) -> Result<()> {
        let source_id = &entry.artifact.source_id;
        if !entry.root.is_dir() {
            return Err(EngineError::MediumUnavailable(format!(
                "primary root '{}' ({}) is not reachable",
                entry.root_id,
                entry.root.display()
            )));
        }

        let path = entry.path();
        remove_if_exists(&path)?;
        remove_if_exists(&integrity::sidecar_path(&path))?;
        remove_if_exists(&crate::archive::meta_path(&path))?;
        dedup::forget(self.store.as_ref(), source_id, entry.id())?;

        if self.settings.prune_mirrors {
            let rel = artifact_rel_path(source_id, entry.id());
            let mut unplugged = Vec::new();
            for mirror in &self.mirrors {
                if mirror.is_available() {
                    remove_mirror_copy(mirror.as_ref(), &rel)?;
                    report.mirror_pruned.push((entry.id().to_string(), mirror.id().to_string()));
                } else {
                    unplugged.push(mirror.id().to_string());
                }
            }
            if !unplugged.is_empty() {
                info!(
                    artifact = %entry.id(),
                    "Mirrors {:?} unavailable; their copies go on a later pass",
                    unplugged
                );
                self.store.save_json(
                    &backlog_ns(source_id),
                    entry.id(),
                    &MirrorBacklog {
                        rel_path: rel,
                        mirrors: unplugged,
                    },
                )?;
            }
        }

        self.ledger.forget(source_id, entry.id())?;
        self.catalog.remove(source_id, entry.id())?;
        info!(source = %source_id, artifact = %entry.id(), "Pruned artifact");
        Ok(())
    }

    /// Remove copies owed by earlier passes from mirrors that are back.
    /// Mirrors no longer configured are dropped from the backlog.
    fn drain_mirror_backlog(&self, source_id: &str, report: &mut RetentionReport) -> Result<()> {
        let ns = backlog_ns(source_id);
        for artifact_id in self.store.list(&ns)? {
            let Some(mut backlog) = self.store.load_json::<MirrorBacklog>(&ns, &artifact_id)? else {
                continue;
            };
            let mut owed = Vec::new();
            for mirror_id in backlog.mirrors.drain(..) {
                match self.mirrors.iter().find(|m| m.id() == mirror_id) {
                    Some(mirror) if mirror.is_available() => {
                        remove_mirror_copy(mirror.as_ref(), &backlog.rel_path)?;
                        debug!(artifact = %artifact_id, "Removed backlogged copy from mirror '{}'", mirror_id);
                        report.mirror_pruned.push((artifact_id.clone(), mirror_id));
                    }
                    Some(_) => owed.push(mirror_id),
                    None => {}
                }
            }
            if owed.is_empty() {
                self.store.delete(&ns, &artifact_id)?;
            } else {
                backlog.mirrors = owed;
                self.store.save_json(&ns, &artifact_id, &backlog)?;
            }
        }
        Ok(())
    }

    fn run_dedup(&self, source_id: &str, report: &mut RetentionReport) {
        let Some(analyzer) = &self.dedup else {
            return;
        };
        let entries = match self.catalog.list(source_id) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(source = %source_id, "Dedup skipped: {}", e);
                return;
            }
        };
        let plan = match analyzer.analyze(&entries) {
            Ok(plan) if !plan.is_empty() => plan,
            Ok(_) => return,
            Err(e) => {
                warn!(source = %source_id, "Dedup analysis failed: {}", e);
                return;
            }
        };
        let is_resolved = |entry: &CatalogEntry| matches!(self.unresolved_reason(entry), Ok(None));
        let outcome = analyzer.apply(source_id, &plan, &is_resolved);
        report.dedup.collapsed += outcome.collapsed;
        report.dedup.deltas += outcome.deltas;
        report.dedup.bytes_saved += outcome.bytes_saved;
    }
}

fn remove_mirror_copy(mirror: &dyn StorageBackend, rel: &str) -> Result<()> {
    mirror.remove(rel)?;
    mirror.remove(&format!("{rel}.{}", integrity::SIDECAR_EXT))?;
    mirror.remove(&format!("{rel}.meta.json"))?;
    mirror.remove(&delivery_sidecar_rel(rel))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
