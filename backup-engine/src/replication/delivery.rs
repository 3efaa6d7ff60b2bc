//! One verified delivery of an artifact to one mirror.

use crate::archive::{meta_path, BackupArtifact};
use crate::integrity;
use crate::storage::StorageBackend;
use crate::store::ledger::DeliveryRecord;
use crate::utils::errors::{EngineError, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const DELIVERY_SIDECAR_EXT: &str = "delivery.json";

/// `<artifact rel path>.delivery.json`
pub fn delivery_sidecar_rel(artifact_rel: &str) -> String {
    format!("{artifact_rel}.{DELIVERY_SIDECAR_EXT}")
}

pub fn read_delivery_sidecar(mirror: &dyn StorageBackend, artifact_rel: &str) -> Result<Option<DeliveryRecord>> {
    let rel = delivery_sidecar_rel(artifact_rel);
    if !mirror.exists(&rel)? {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&mirror.read(&rel)?)?))
}

/// Copy `src` (the committed primary copy of `artifact`) to `mirror` and
/// prove the mirror's copy matches. Returns the record to put in the
/// ledger; the same record is left next to the copy on the mirror.
pub fn deliver(mirror: &dyn StorageBackend, src: &Path, artifact: &BackupArtifact) -> Result<DeliveryRecord> {
    let pending = |reason: String| EngineError::MirrorPending {
        mirror: mirror.id().to_string(),
        reason,
    };

    mirror.ensure_available().map_err(|e| pending(e.to_string()))?;
    let rel = artifact.rel_path();
    let expected = &artifact.content_hash;

    let already_there = mirror.exists(&rel)? && mirror.hash(&rel)? == *expected;
    if already_there {
        debug!(artifact = %artifact.id, "Mirror '{}' already holds a matching copy", mirror.id());
    } else {
        let free = mirror.free_space()?;
        if free < artifact.size_bytes {
            return Err(pending(format!(
                "insufficient space: {} bytes free, {} needed",
                free, artifact.size_bytes
            )));
        }
        if !src.is_file() {
            return Err(pending(format!("primary copy {} is not reachable", src.display())));
        }
        let summary = mirror.receive_verified(src, &rel, expected)?;
        info!(artifact = %artifact.id, "Copied to mirror '{}': {}", mirror.id(), summary);
    }

    // Re-hash what the mirror holds now; only this proves delivery
    let verified = mirror.hash(&rel)?;
    if verified != *expected {
        return Err(EngineError::integrity(mirror.resolve(&rel), expected, verified));
    }

    mirror.write_atomic(
        &format!("{rel}.{}", integrity::SIDECAR_EXT),
        integrity::format_sidecar(&verified).as_bytes(),
    )?;
    let meta = meta_path(src);
    if meta.is_file() {
        mirror.write_atomic(&format!("{rel}.meta.json"), &fs::read(&meta)?)?;
    }

    let record = DeliveryRecord::new(&artifact.id, mirror.id(), verified);
    mirror.write_atomic(&delivery_sidecar_rel(&rel), &serde_json::to_vec_pretty(&record)?)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::catalog::tests::sample_entry;
    use crate::storage::{LocalBackend, RemovableBackend};
    use tempfile::TempDir;

    fn artifact_on_disk(dir: &TempDir, bytes: &[u8]) -> (BackupArtifact, std::path::PathBuf) {
        let mut entry = sample_entry("src", "F1", 0, "F1", None, 1);
        entry.root = dir.path().to_path_buf();
        entry.artifact.content_hash = integrity::hash_bytes(bytes);
        entry.artifact.size_bytes = bytes.len() as u64;
        let path = entry.path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, bytes).unwrap();
        (entry.artifact, path)
    }

    #[test]
    fn test_delivery_writes_copy_and_sidecars() -> Result<()> {
        let primary = TempDir::new()?;
        let mirror_dir = TempDir::new()?;
        let (artifact, src) = artifact_on_disk(&primary, b"payload");
        let mirror = LocalBackend::new("offsite", mirror_dir.path());

        let record = deliver(&mirror, &src, &artifact)?;

        assert_eq!(record.verified_hash, artifact.content_hash);
        assert_eq!(mirror.read("src/F1")?, b"payload");
        assert_eq!(read_delivery_sidecar(&mirror, "src/F1")?, Some(record));
        assert_eq!(
            integrity::read_sidecar(&mirror.resolve("src/F1"))?,
            artifact.content_hash
        );
        Ok(())
    }

    #[test]
    fn test_absent_medium_is_pending() -> Result<()> {
        let primary = TempDir::new()?;
        let mount = TempDir::new()?;
        let (artifact, src) = artifact_on_disk(&primary, b"payload");
        let mirror = RemovableBackend::new("usb", mount.path(), None);

        let err = deliver(&mirror, &src, &artifact).unwrap_err();
        assert!(matches!(err, EngineError::MirrorPending { .. }));
        Ok(())
    }

    #[test]
    fn test_corrupt_primary_is_never_delivered() -> Result<()> {
        let primary = TempDir::new()?;
        let mirror_dir = TempDir::new()?;
        let (artifact, src) = artifact_on_disk(&primary, b"payload");
        fs::write(&src, b"bitrot!")?;
        let mirror = LocalBackend::new("offsite", mirror_dir.path());

        let err = deliver(&mirror, &src, &artifact).unwrap_err();
        assert!(matches!(err, EngineError::Integrity { .. }));
        assert!(!mirror.exists("src/F1")?);
        assert!(read_delivery_sidecar(&mirror, "src/F1")?.is_none());
        Ok(())
    }
}
