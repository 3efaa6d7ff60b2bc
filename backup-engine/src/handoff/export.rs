//! Export side of the handoff.

use crate::archive::meta_path;
use crate::handoff::manifest::{read_manifest, write_manifest, HandoffManifest, ManifestEntry};
use crate::handoff::marker::{read_marker, write_marker, HandoffMarker};
use crate::handoff::{harvest_acks, medium_artifact_rel, prune_medium, require_medium};
use crate::integrity;
use crate::storage::StorageBackend;
use crate::store::catalog::{ArtifactCatalog, CatalogEntry};
use crate::store::ledger::DeliveryLedger;
use crate::store::StateStore;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    pub sequence_number: u64,
    pub entries: usize,
    pub copied: Vec<String>,
    pub already_present: usize,
    pub pruned: Vec<String>,
    pub acks_harvested: usize,
    /// Artifacts that still need handing off but whose primary copy is not reachable
    pub skipped: Vec<String>,
}

pub struct HandoffExporter {
    medium: Arc<dyn StorageBackend>,
    catalog: ArtifactCatalog,
    ledger: DeliveryLedger,
    importers: Vec<String>,
    identity: String,
}

impl HandoffExporter {
    pub fn new(store: Arc<dyn StateStore>, medium: Arc<dyn StorageBackend>, importers: Vec<String>, identity: &str) -> Self {
        Self {
            medium,
            catalog: ArtifactCatalog::new(Arc::clone(&store)),
            ledger: DeliveryLedger::new(store),
            importers,
            identity: identity.to_string(),
        }
    }

    /// Write a new export sequence for `source_ids` onto the medium.
    ///
    /// Cumulative: every catalog artifact not yet acknowledged by all
    /// importers goes on the medium, not only the newest one.
    pub fn export(&self, source_ids: &[String], cancel: &CancellationToken) -> Result<ExportReport> {
        let medium = self.medium.as_ref();
        require_medium(medium)?;

        let mut report = ExportReport {
            acks_harvested: harvest_acks(medium, &self.catalog, &self.ledger, &self.importers)?,
            ..ExportReport::default()
        };

        // The medium is not importable while it is being rewritten
        let previous = read_marker(medium)?
            .map(|m| m.sequence_number)
            .max(read_manifest(medium)?.map(|m| m.sequence_number))
            .unwrap_or(0);
        write_marker(medium, &HandoffMarker::new(previous, false, &self.identity))?;

        report.pruned = prune_medium(medium, &self.catalog, &self.ledger, &self.importers)?;

        let mut entries = Vec::new();
        for source_id in source_ids {
            for entry in self.catalog.list(source_id)? {
                if self.acknowledged_by_all(&entry)? {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                match self.place(&entry)? {
                    Placement::Copied => report.copied.push(entry.artifact.id.clone()),
                    Placement::AlreadyPresent => report.already_present += 1,
                    Placement::SourceUnreachable => {
                        report.skipped.push(entry.artifact.id.clone());
                        continue;
                    }
                }
                entries.push(ManifestEntry {
                    name: entry.artifact.id.clone(),
                    source_id: source_id.clone(),
                    size: entry.artifact.size_bytes,
                    mtime: entry.artifact.created_at,
                    path: medium_artifact_rel(source_id, &entry.artifact.id),
                    sha256: entry.artifact.content_hash,
                });
            }
        }

        // Every listed file must verify on the medium itself
        for item in &entries {
            let actual = medium.hash(&item.path)?;
            if actual != item.sha256 {
                return Err(EngineError::integrity(medium.resolve(&item.path), item.sha256, actual));
            }
        }

        let sequence_number = previous + 1;
        write_manifest(
            medium,
            &HandoffManifest {
                sequence_number,
                exported_by: self.identity.clone(),
                created_at: Utc::now(),
                importers: self.importers.clone(),
                entries,
            },
        )?;
        write_marker(medium, &HandoffMarker::new(sequence_number, true, &self.identity))?;

        report.sequence_number = sequence_number;
        report.entries = report.copied.len() + report.already_present;
        info!(
            "Export sequence {} ready on '{}': {} entries ({} copied), {} pruned",
            sequence_number,
            medium.id(),
            report.entries,
            report.copied.len(),
            report.pruned.len()
        );
        Ok(report)
    }

    fn acknowledged_by_all(&self, entry: &CatalogEntry) -> Result<bool> {
        for importer in &self.importers {
            if !self.ledger.is_delivered(
                &entry.artifact.source_id,
                &entry.artifact.id,
                importer,
                &entry.artifact.content_hash,
            )? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn place(&self, entry: &CatalogEntry) -> Result<Placement> {
        let medium = self.medium.as_ref();
        let rel = medium_artifact_rel(&entry.artifact.source_id, &entry.artifact.id);
        let expected = &entry.artifact.content_hash;

        if medium.exists(&rel)? && medium.hash(&rel)? == *expected {
            return Ok(Placement::AlreadyPresent);
        }

        let src = entry.path();
        if !src.is_file() {
            warn!(artifact = %entry.artifact.id, "Primary copy {} not reachable; not exported", src.display());
            return Ok(Placement::SourceUnreachable);
        }

        let summary = medium.receive_verified(&src, &rel, expected)?;
        medium.write_atomic(
            &format!("{rel}.{}", integrity::SIDECAR_EXT),
            integrity::format_sidecar(expected).as_bytes(),
        )?;
        let meta = meta_path(&src);
        if meta.is_file() {
            medium.write_atomic(&format!("{rel}.meta.json"), &fs::read(&meta)?)?;
        }
        info!(artifact = %entry.artifact.id, "Exported to medium: {}", summary);
        Ok(Placement::Copied)
    }
}

enum Placement {
    Copied,
    AlreadyPresent,
    SourceUnreachable,
}
