//! Snapshot Tracker: per-source incremental state.
//!
//! Generation 0 is a full baseline. Each committed incremental bumps the
//! generation by one and replaces the change index. Nothing is persisted
//! until [`SnapshotTracker::commit`], which the archive builder calls only
//! after its artifact is durably in place; an interrupted run therefore
//! leaves the previous index untouched and the next run re-captures
//! whatever was missed.

pub mod index;

use crate::store::{StateStore, StoreExt};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
pub use index::{compute_delta, ChangeIndex, Delta};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const NAMESPACE: &str = "snapshots";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotState {
    pub source_id: String,
    pub generation: u64,
    /// Artifact id of the generation-0 capture this chain is measured against
    pub baseline: Option<String>,
    /// Artifact id of the most recent committed capture
    pub last_artifact: Option<String>,
    pub change_index: ChangeIndex,
    pub committed_at: Option<DateTime<Utc>>,
}

impl SnapshotState {
    pub fn is_baseline(&self) -> bool {
        self.generation == 0
    }
}

pub struct SnapshotTracker {
    store: Arc<dyn StateStore>,
}

impl SnapshotTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Last committed state, if any.
    pub fn current(&self, source_id: &str) -> Result<Option<SnapshotState>> {
        self.store.load_json(NAMESPACE, source_id)
    }

    /// Fresh generation-0 state. The committed state stays in force until the
    /// new baseline is committed, at which point every earlier incremental
    /// marker for the source is superseded.
    pub fn reset_baseline(&self, source_id: &str) -> SnapshotState {
        SnapshotState {
            source_id: source_id.to_string(),
            generation: 0,
            baseline: None,
            last_artifact: None,
            change_index: ChangeIndex::default(),
            committed_at: None,
        }
    }

    /// State for the next incremental capture. The returned change index is
    /// the committed one, i.e. the reference the delta is computed against.
    pub fn next_state(&self, source_id: &str) -> Result<SnapshotState> {
        let current = self.current(source_id)?.ok_or_else(|| {
            EngineError::Config(format!(
                "incremental backup of '{source_id}' requested but no baseline exists; run a full backup first"
            ))
        })?;

        Ok(SnapshotState {
            generation: current.generation + 1,
            ..current
        })
    }

    /// Persist a captured state. Generation 0 always replaces the chain;
    /// anything else must extend the committed chain by exactly one.
    pub fn commit(&self, source_id: &str, new_state: SnapshotState) -> Result<()> {
        if new_state.source_id != source_id {
            return Err(EngineError::StateConflict(format!(
                "state for '{}' committed under '{}'",
                new_state.source_id, source_id
            )));
        }

        let generation = new_state.generation;
        let mut pending = Some(new_state);
        self.store
            .update_json::<SnapshotState, _>(NAMESPACE, source_id, |current| {
                let next = pending.take().ok_or_else(|| {
                    EngineError::StateConflict("snapshot commit applied twice".into())
                })?;

                if next.generation > 0 {
                    let current = current.ok_or_else(|| {
                        EngineError::StateConflict(format!(
                            "generation {} for '{}' has no committed predecessor",
                            next.generation, source_id
                        ))
                    })?;
                    if current.generation + 1 != next.generation || current.baseline != next.baseline {
                        return Err(EngineError::StateConflict(format!(
                            "snapshot for '{}' moved to generation {} (baseline {:?}) while committing generation {}",
                            source_id, current.generation, current.baseline, next.generation
                        )));
                    }
                }
                Ok(Some(next))
            })?;

        info!(source = %source_id, generation, "Snapshot state committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStateStore;
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> SnapshotTracker {
        SnapshotTracker::new(Arc::new(FsStateStore::open(dir.path()).unwrap()))
    }

    fn committed(mut state: SnapshotState, artifact: &str) -> SnapshotState {
        if state.generation == 0 {
            state.baseline = Some(artifact.to_string());
        }
        state.last_artifact = Some(artifact.to_string());
        state.committed_at = Some(Utc::now());
        state
    }

    #[test]
    fn test_incremental_without_baseline_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = tracker(&dir).next_state("projects").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_generations_advance() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);

        let base = tracker.reset_baseline("projects");
        tracker.commit("projects", committed(base, "F1"))?;

        let next = tracker.next_state("projects")?;
        assert_eq!(next.generation, 1);
        assert_eq!(next.baseline.as_deref(), Some("F1"));
        tracker.commit("projects", committed(next, "I1"))?;

        let current = tracker.current("projects")?.unwrap();
        assert_eq!(current.generation, 1);
        assert_eq!(current.last_artifact.as_deref(), Some("I1"));
        Ok(())
    }

    #[test]
    fn test_uncommitted_reset_keeps_previous_chain() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.commit("projects", committed(tracker.reset_baseline("projects"), "F1"))?;

        // A full run that fails before commit
        let _abandoned = tracker.reset_baseline("projects");

        assert_eq!(tracker.next_state("projects")?.baseline.as_deref(), Some("F1"));
        Ok(())
    }

    #[test]
    fn test_stale_generation_is_rejected() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.commit("projects", committed(tracker.reset_baseline("projects"), "F1"))?;

        let a = tracker.next_state("projects")?;
        let b = tracker.next_state("projects")?;
        tracker.commit("projects", committed(a, "I1"))?;

        let err = tracker.commit("projects", committed(b, "I1b")).unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
        Ok(())
    }

    #[test]
    fn test_new_baseline_supersedes_chain() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.commit("projects", committed(tracker.reset_baseline("projects"), "F1"))?;
        tracker.commit("projects", committed(tracker.next_state("projects")?, "I1"))?;

        tracker.commit("projects", committed(tracker.reset_baseline("projects"), "F2"))?;

        let next = tracker.next_state("projects")?;
        assert_eq!(next.generation, 1);
        assert_eq!(next.baseline.as_deref(), Some("F2"));
        Ok(())
    }
}
