//! Delivery ledger and pending-mirror markers.
//!
//! `deliveries/<source>/<artifact>` maps destination ids (mirrors and
//! handoff importers) to the [`DeliveryRecord`] proving they hold an exact
//! copy. `pending/<source>/<artifact>` maps mirror ids to the
//! [`PendingMirror`] marker that a later run retries.

use crate::integrity::ContentHash;
use crate::store::{StateStore, StoreExt};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub artifact_id: String,
    pub destination_id: String,
    /// Digest recomputed on the destination's own copy
    pub verified_hash: ContentHash,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(artifact_id: &str, destination_id: &str, verified_hash: ContentHash) -> Self {
        Self {
            artifact_id: artifact_id.to_string(),
            destination_id: destination_id.to_string(),
            verified_hash,
            delivered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMirror {
    pub source_id: String,
    pub artifact_id: String,
    pub mirror_id: String,
    /// Where the committed primary copy lives
    pub primary_path: PathBuf,
    pub content_hash: ContentHash,
    pub attempts: u32,
    pub last_error: String,
    pub since: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
}

type Deliveries = BTreeMap<String, DeliveryRecord>;
type Pending = BTreeMap<String, PendingMirror>;

pub struct DeliveryLedger {
    store: Arc<dyn StateStore>,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn deliveries_ns(source_id: &str) -> String {
        format!("deliveries/{source_id}")
    }

    fn pending_ns(source_id: &str) -> String {
        format!("pending/{source_id}")
    }

    pub fn record(&self, source_id: &str, record: DeliveryRecord) -> Result<()> {
        let artifact_id = record.artifact_id.clone();
        let mut record = Some(record);
        self.store
            .update_json::<Deliveries, _>(&Self::deliveries_ns(source_id), &artifact_id, |current| {
                let mut map = current.unwrap_or_default();
                if let Some(record) = record.take() {
                    map.insert(record.destination_id.clone(), record);
                }
                Ok(Some(map))
            })
    }

    pub fn deliveries(&self, source_id: &str, artifact_id: &str) -> Result<Deliveries> {
        Ok(self
            .store
            .load_json::<Deliveries>(&Self::deliveries_ns(source_id), artifact_id)?
            .unwrap_or_default())
    }

    /// Whether `destination_id` holds a verified copy matching `hash`.
    pub fn is_delivered(&self, source_id: &str, artifact_id: &str, destination_id: &str, hash: &ContentHash) -> Result<bool> {
        Ok(self
            .deliveries(source_id, artifact_id)?
            .get(destination_id)
            .is_some_and(|record| record.verified_hash == *hash))
    }

    /// Forget one destination's record, e.g. after its copy failed
    /// re-verification.
    pub fn revoke(&self, source_id: &str, artifact_id: &str, destination_id: &str) -> Result<()> {
        self.store
            .update_json::<Deliveries, _>(&Self::deliveries_ns(source_id), artifact_id, |current| {
                let mut map = current.unwrap_or_default();
                map.remove(destination_id);
                Ok((!map.is_empty()).then_some(map))
            })
    }

    pub fn mark_pending(&self, marker: PendingMirror) -> Result<()> {
        let source_id = marker.source_id.clone();
        let artifact_id = marker.artifact_id.clone();
        let mut marker = Some(marker);
        self.store
            .update_json::<Pending, _>(&Self::pending_ns(&source_id), &artifact_id, |current| {
                let mut map = current.unwrap_or_default();
                if let Some(mut marker) = marker.take() {
                    // Keep the original "since" and count attempts across runs
                    if let Some(previous) = map.get(&marker.mirror_id) {
                        marker.since = previous.since;
                        marker.attempts = previous.attempts + marker.attempts.max(1);
                    }
                    map.insert(marker.mirror_id.clone(), marker);
                }
                Ok(Some(map))
            })
    }

    pub fn clear_pending(&self, source_id: &str, artifact_id: &str, mirror_id: &str) -> Result<()> {
        self.store
            .update_json::<Pending, _>(&Self::pending_ns(source_id), artifact_id, |current| {
                let mut map = current.unwrap_or_default();
                map.remove(mirror_id);
                Ok((!map.is_empty()).then_some(map))
            })
    }

    /// Every pending marker of a source, oldest artifact first.
    pub fn pending(&self, source_id: &str) -> Result<Vec<PendingMirror>> {
        let maps: Vec<Pending> = self.store.load_all(&Self::pending_ns(source_id))?;
        let mut markers: Vec<PendingMirror> = maps.into_iter().flat_map(|m| m.into_values()).collect();
        markers.sort_by(|a, b| a.since.cmp(&b.since).then_with(|| a.artifact_id.cmp(&b.artifact_id)));
        Ok(markers)
    }

    pub fn pending_for(&self, source_id: &str, artifact_id: &str) -> Result<Vec<PendingMirror>> {
        Ok(self
            .store
            .load_json::<Pending>(&Self::pending_ns(source_id), artifact_id)?
            .map(|m| m.into_values().collect())
            .unwrap_or_default())
    }

    /// Drop every record about an artifact once it has been pruned.
    pub fn forget(&self, source_id: &str, artifact_id: &str) -> Result<()> {
        self.store.delete(&Self::deliveries_ns(source_id), artifact_id)?;
        self.store.delete(&Self::pending_ns(source_id), artifact_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;
    use crate::store::FsStateStore;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> DeliveryLedger {
        DeliveryLedger::new(Arc::new(FsStateStore::open(dir.path()).unwrap()))
    }

    fn marker(artifact: &str, mirror: &str) -> PendingMirror {
        PendingMirror {
            source_id: "src".into(),
            artifact_id: artifact.into(),
            mirror_id: mirror.into(),
            primary_path: PathBuf::from("/backups/src").join(artifact),
            content_hash: hash_bytes(artifact.as_bytes()),
            attempts: 1,
            last_error: "unreachable".into(),
            since: Utc::now(),
            last_attempt: Utc::now(),
        }
    }

    #[test]
    fn test_delivery_requires_matching_hash() -> Result<()> {
        let dir = TempDir::new()?;
        let ledger = ledger(&dir);
        let hash = hash_bytes(b"artifact");

        ledger.record("src", DeliveryRecord::new("F1", "mirror-a", hash))?;

        assert!(ledger.is_delivered("src", "F1", "mirror-a", &hash)?);
        assert!(!ledger.is_delivered("src", "F1", "mirror-a", &hash_bytes(b"other"))?);
        assert!(!ledger.is_delivered("src", "F1", "mirror-b", &hash)?);
        Ok(())
    }

    #[test]
    fn test_records_per_destination_accumulate() -> Result<()> {
        let dir = TempDir::new()?;
        let ledger = ledger(&dir);
        let hash = hash_bytes(b"artifact");

        ledger.record("src", DeliveryRecord::new("F1", "vault-work", hash))?;
        ledger.record("src", DeliveryRecord::new("F1", "vault-home", hash))?;
        assert_eq!(ledger.deliveries("src", "F1")?.len(), 2);

        ledger.revoke("src", "F1", "vault-work")?;
        let remaining = ledger.deliveries("src", "F1")?;
        assert_eq!(remaining.keys().collect::<Vec<_>>(), vec!["vault-home"]);
        Ok(())
    }

    #[test]
    fn test_pending_attempts_accumulate() -> Result<()> {
        let dir = TempDir::new()?;
        let ledger = ledger(&dir);

        ledger.mark_pending(marker("F1", "mirror-a"))?;
        ledger.mark_pending(marker("F1", "mirror-a"))?;
        ledger.mark_pending(marker("F1", "mirror-b"))?;

        let pending = ledger.pending_for("src", "F1")?;
        assert_eq!(pending.len(), 2);
        let a = pending.iter().find(|m| m.mirror_id == "mirror-a").unwrap();
        assert_eq!(a.attempts, 2);

        ledger.clear_pending("src", "F1", "mirror-a")?;
        ledger.clear_pending("src", "F1", "mirror-b")?;
        assert!(ledger.pending("src")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_forget_drops_everything() -> Result<()> {
        let dir = TempDir::new()?;
        let ledger = ledger(&dir);
        ledger.record("src", DeliveryRecord::new("F1", "m", hash_bytes(b"x")))?;
        ledger.mark_pending(marker("F1", "n"))?;

        ledger.forget("src", "F1")?;

        assert!(ledger.deliveries("src", "F1")?.is_empty());
        assert!(ledger.pending_for("src", "F1")?.is_empty());
        Ok(())
    }
}
