//! Handoff Mediator: carry artifacts across an air gap on removable media.
//!
//! Medium layout:
//!
//! ```text
//! .backup-medium                                  label (see storage::removable)
//! handoff/marker.json                             sequence number + ready flag
//! handoff/manifest.json                           entries of the current sequence
//! handoff/artifacts/<source>/<artifact>           artifact + .sha256 + .meta.json
//! handoff/acks/<importer>/<source>/<artifact>.delivery.json
//! ```
//!
//! The exporting side writes artifacts and flips the ready flag only after
//! every manifest entry verified on the medium. Each importer copies what it
//! lacks into its own vault and leaves an acknowledgement under its own
//! identity. A medium copy is removed only once every configured importer
//! has acknowledged it.

pub mod export;
pub mod import;
pub mod manifest;
pub mod marker;

use crate::integrity;
use crate::storage::StorageBackend;
use crate::store::catalog::ArtifactCatalog;
use crate::store::ledger::{DeliveryLedger, DeliveryRecord};
use crate::utils::errors::{EngineError, Result};
pub use export::{ExportReport, HandoffExporter};
pub use import::{last_import, HandoffImporter, ImportReport, ImportState};
use tracing::{debug, info, warn};

pub const MARKER_REL: &str = "handoff/marker.json";
pub const MANIFEST_REL: &str = "handoff/manifest.json";
const ARTIFACTS_REL: &str = "handoff/artifacts";
const ACKS_REL: &str = "handoff/acks";
const ACK_EXT: &str = ".delivery.json";

pub fn medium_artifact_rel(source_id: &str, artifact_id: &str) -> String {
    format!("{ARTIFACTS_REL}/{source_id}/{artifact_id}")
}

pub fn ack_rel(importer: &str, source_id: &str, artifact_id: &str) -> String {
    format!("{ACKS_REL}/{importer}/{source_id}/{artifact_id}{ACK_EXT}")
}

/// Every handoff operation needs the medium; its absence is reported the
/// same way whichever backend stands in for it.
pub(crate) fn require_medium(medium: &dyn StorageBackend) -> Result<()> {
    medium.ensure_available().map_err(|e| match e {
        EngineError::MediumUnavailable(_) => e,
        other => EngineError::MediumUnavailable(format!("{}: {}", medium.id(), other)),
    })
}

/// Copy importer acknowledgements from the medium into the local ledger.
/// An ack is only taken if its digest matches the catalog.
pub fn harvest_acks(
    medium: &dyn StorageBackend,
    catalog: &ArtifactCatalog,
    ledger: &DeliveryLedger,
    importers: &[String],
) -> Result<usize> {
    let mut harvested = 0;
    for importer in importers {
        let importer_dir = format!("{ACKS_REL}/{importer}");
        for source_id in medium.list_dirs(&importer_dir)? {
            for file in medium.list(&format!("{importer_dir}/{source_id}"))? {
                let Some(artifact_id) = file.strip_suffix(ACK_EXT) else {
                    continue;
                };
                let record: DeliveryRecord =
                    match serde_json::from_slice(&medium.read(&ack_rel(importer, &source_id, artifact_id))?) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!("Unreadable ack {}/{} from '{}': {}", source_id, artifact_id, importer, e);
                            continue;
                        }
                    };

                let Some(entry) = catalog.get(&source_id, artifact_id)? else {
                    debug!("Ack for unknown artifact {}/{}", source_id, artifact_id);
                    continue;
                };
                if record.destination_id != *importer || record.verified_hash != entry.artifact.content_hash {
                    warn!(
                        artifact = %artifact_id,
                        "Ack from '{}' does not match the catalog digest; ignored",
                        importer
                    );
                    continue;
                }
                if !ledger.is_delivered(&source_id, artifact_id, importer, &record.verified_hash)? {
                    ledger.record(&source_id, record)?;
                    harvested += 1;
                }
            }
        }
    }
    if harvested > 0 {
        info!("Harvested {} importer acknowledgement(s) from the medium", harvested);
    }
    Ok(harvested)
}

/// Remove medium copies every importer has acknowledged. Returns the
/// removed artifact ids.
pub fn prune_medium(
    medium: &dyn StorageBackend,
    catalog: &ArtifactCatalog,
    ledger: &DeliveryLedger,
    importers: &[String],
) -> Result<Vec<String>> {
    require_medium(medium)?;
    let mut pruned = Vec::new();
    if importers.is_empty() {
        return Ok(pruned);
    }

    for source_id in medium.list_dirs(ARTIFACTS_REL)? {
        let dir = format!("{ARTIFACTS_REL}/{source_id}");
        for name in medium.list(&dir)? {
            if !crate::archive::naming::ArtifactName::is_artifact_name(&name) {
                continue;
            }
            let rel = medium_artifact_rel(&source_id, &name);
            let hash = match catalog.get(&source_id, &name)? {
                Some(entry) => entry.artifact.content_hash,
                // Pruned locally already; the medium's own sidecar still
                // names the digest the acks were made against
                None => integrity::read_sidecar(&medium.resolve(&rel))?,
            };

            let mut acknowledged_by_all = true;
            for importer in importers {
                if !ledger.is_delivered(&source_id, &name, importer, &hash)? {
                    acknowledged_by_all = false;
                    break;
                }
            }
            if !acknowledged_by_all {
                continue;
            }

            medium.remove(&rel)?;
            medium.remove(&format!("{rel}.{}", integrity::SIDECAR_EXT))?;
            medium.remove(&format!("{rel}.meta.json"))?;
            for importer in importers {
                medium.remove(&ack_rel(importer, &source_id, &name))?;
            }
            info!(artifact = %name, "Removed from medium '{}': acknowledged by every importer", medium.id());
            pruned.push(name);
        }
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;
    use crate::store::catalog::tests::sample_entry;
    use crate::store::{FsStateStore, StateStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_single_importer_ack_does_not_prune() -> Result<()> {
        let state = TempDir::new()?;
        let medium_dir = TempDir::new()?;
        let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(state.path())?);
        let catalog = ArtifactCatalog::new(Arc::clone(&store));
        let ledger = DeliveryLedger::new(store);
        let medium = LocalBackend::new("usb", medium_dir.path());

        let entry = sample_entry("src", "FULL__2026-01-01__00-00-00-000__host-a.pack", 0, "x", None, 1);
        catalog.insert(&entry)?;
        let rel = medium_artifact_rel("src", entry.id());
        medium.write_atomic(&rel, b"bytes")?;

        let importers = vec!["work".to_string(), "home".to_string()];
        let hash = entry.artifact.content_hash;
        ledger.record("src", DeliveryRecord::new(entry.id(), "work", hash))?;

        assert!(prune_medium(&medium, &catalog, &ledger, &importers)?.is_empty());
        assert!(medium.exists(&rel)?);

        ledger.record("src", DeliveryRecord::new(entry.id(), "home", hash))?;
        assert_eq!(prune_medium(&medium, &catalog, &ledger, &importers)?.len(), 1);
        assert!(!medium.exists(&rel)?);
        Ok(())
    }

    #[test]
    fn test_missing_medium_is_reported_as_unavailable() {
        let medium = LocalBackend::new("usb", "/nonexistent/medium");
        assert!(matches!(
            require_medium(&medium),
            Err(EngineError::MediumUnavailable(_))
        ));
    }
}
