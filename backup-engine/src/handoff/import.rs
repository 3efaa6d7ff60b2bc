//! Import side of the handoff.

use crate::archive::{meta_path, read_meta};
use crate::handoff::manifest::{read_manifest, ManifestEntry};
use crate::handoff::marker::read_marker;
use crate::handoff::{ack_rel, require_medium};
use crate::integrity;
use crate::storage::StorageBackend;
use crate::store::catalog::{artifact_rel_path, ArtifactCatalog, CatalogEntry};
use crate::store::ledger::{DeliveryLedger, DeliveryRecord};
use crate::store::{StateStore, StoreExt};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const NAMESPACE: &str = "handoff";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub sequence_number: u64,
    pub copied: Vec<String>,
    pub already_present: usize,
    /// (artifact, reason) for entries that failed verification
    pub failed: Vec<(String, String)>,
}

/// What an importer remembers between imports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportState {
    pub identity: String,
    pub last_sequence: u64,
    pub imported_at: DateTime<Utc>,
}

pub fn last_import(store: &dyn StateStore, identity: &str) -> Result<Option<ImportState>> {
    store.load_json(NAMESPACE, &format!("import-{identity}"))
}

pub struct HandoffImporter {
    store: Arc<dyn StateStore>,
    medium: Arc<dyn StorageBackend>,
    vault: Arc<dyn StorageBackend>,
    ledger: DeliveryLedger,
    catalog: ArtifactCatalog,
    identity: String,
}

impl HandoffImporter {
    pub fn new(
        store: Arc<dyn StateStore>,
        medium: Arc<dyn StorageBackend>,
        vault: Arc<dyn StorageBackend>,
        identity: &str,
    ) -> Self {
        Self {
            ledger: DeliveryLedger::new(Arc::clone(&store)),
            catalog: ArtifactCatalog::new(Arc::clone(&store)),
            store,
            medium,
            vault,
            identity: identity.to_string(),
        }
    }

    pub fn last_sequence(&self) -> Result<Option<u64>> {
        Ok(last_import(self.store.as_ref(), &self.identity)?.map(|s| s.last_sequence))
    }

    /// Pull the medium's current sequence into the vault.
    pub fn import(&self, cancel: &CancellationToken) -> Result<ImportReport> {
        let medium = self.medium.as_ref();
        require_medium(medium)?;

        let marker = read_marker(medium)?.ok_or(EngineError::HandoffNotReady { sequence: 0 })?;
        if !marker.ready {
            return Err(EngineError::HandoffNotReady {
                sequence: marker.sequence_number,
            });
        }
        let manifest = read_manifest(medium)?
            .filter(|m| m.sequence_number == marker.sequence_number)
            .ok_or(EngineError::HandoffNotReady {
                sequence: marker.sequence_number,
            })?;

        if let Some(last) = self.last_sequence()? {
            if last >= manifest.sequence_number {
                info!("Sequence {} already imported; re-checking entries", manifest.sequence_number);
            }
        }

        let mut report = ImportReport {
            sequence_number: manifest.sequence_number,
            ..ImportReport::default()
        };

        for item in &manifest.entries {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.import_entry(item) {
                Ok(true) => report.copied.push(item.name.clone()),
                Ok(false) => report.already_present += 1,
                Err(e @ (EngineError::MediumUnavailable(_) | EngineError::Cancelled)) => return Err(e),
                Err(e) => {
                    error!(artifact = %item.name, "Import failed: {}", e);
                    report.failed.push((item.name.clone(), e.to_string()));
                }
            }
        }

        if report.failed.is_empty() {
            self.store.save_json(
                NAMESPACE,
                &format!("import-{}", self.identity),
                &ImportState {
                    identity: self.identity.clone(),
                    last_sequence: manifest.sequence_number,
                    imported_at: Utc::now(),
                },
            )?;
        }

        info!(
            "Imported sequence {} as '{}': {} copied, {} already present, {} failed",
            report.sequence_number,
            self.identity,
            report.copied.len(),
            report.already_present,
            report.failed.len()
        );
        Ok(report)
    }

    /// Returns whether bytes were copied.
    fn import_entry(&self, item: &ManifestEntry) -> Result<bool> {
        let medium = self.medium.as_ref();
        let vault = self.vault.as_ref();
        let local_rel = artifact_rel_path(&item.source_id, &item.name);

        let present = vault.exists(&local_rel)? && vault.hash(&local_rel)? == item.sha256;
        if !present {
            let summary = vault.receive_verified(&medium.resolve(&item.path), &local_rel, &item.sha256)?;
            info!(artifact = %item.name, "Imported into vault '{}': {}", vault.id(), summary);
        }

        let verified = vault.hash(&local_rel)?;
        if verified != item.sha256 {
            return Err(EngineError::integrity(vault.resolve(&local_rel), item.sha256, verified));
        }

        let local_path = vault.resolve(&local_rel);
        integrity::write_sidecar(&local_path, &verified)?;
        let medium_meta = meta_path(&medium.resolve(&item.path));
        if medium_meta.is_file() {
            vault.write_atomic(&format!("{local_rel}.meta.json"), &std::fs::read(&medium_meta)?)?;
            match read_meta(&local_path) {
                Ok(artifact) if artifact.content_hash == verified => self.catalog.insert(&CatalogEntry {
                    artifact,
                    root_id: vault.id().to_string(),
                    root: vault.root().to_path_buf(),
                    rel_path: local_rel.clone(),
                })?,
                Ok(_) => warn!(artifact = %item.name, "Metadata digest disagrees with manifest; not cataloged"),
                Err(e) => warn!(artifact = %item.name, "Unreadable metadata: {}", e),
            }
        }

        let record = DeliveryRecord::new(&item.name, &self.identity, verified);
        self.ledger.record(&item.source_id, record.clone())?;
        medium.write_atomic(
            &ack_rel(&self.identity, &item.source_id, &item.name),
            &serde_json::to_vec_pretty(&record)?,
        )?;

        Ok(!present)
    }
}
