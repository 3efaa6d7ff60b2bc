//! The `status` document: what an external caller needs to know without
//! touching the engine's state files directly.

use crate::config::Config;
use crate::executor::report::RunReport;
use crate::handoff::marker::{read_marker, HandoffMarker};
use crate::handoff::{last_import, ImportState};
use crate::retention::RetentionManager;
use crate::snapshot::SnapshotTracker;
use crate::storage::StorageBackend;
use crate::store::catalog::ArtifactCatalog;
use crate::store::ledger::{DeliveryLedger, PendingMirror};
use crate::store::{StateStore, StoreExt};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub host_id: String,
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceStatus>,
    pub retention_last_run: Option<DateTime<Utc>>,
    pub handoff: Option<HandoffStatus>,
}

#[derive(Debug, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub generation: Option<u64>,
    pub baseline: Option<String>,
    pub last_artifact: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
    pub artifacts: usize,
    pub stored_bytes: u64,
    pub pending_mirrors: Vec<PendingMirror>,
    pub last_runs: Vec<RunReport>,
}

#[derive(Debug, Serialize)]
pub struct HandoffStatus {
    pub identity: String,
    pub medium_available: bool,
    pub marker: Option<HandoffMarker>,
    pub last_import: Option<ImportState>,
}

pub fn collect(
    config: &Config,
    store: Arc<dyn StateStore>,
    retention: &RetentionManager,
    medium: Option<Arc<dyn StorageBackend>>,
) -> Result<EngineStatus> {
    let tracker = SnapshotTracker::new(Arc::clone(&store));
    let catalog = ArtifactCatalog::new(Arc::clone(&store));
    let ledger = DeliveryLedger::new(Arc::clone(&store));

    let mut sources = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let state = tracker.current(&source.id)?;
        let entries = catalog.list(&source.id)?;
        let mut last_runs = Vec::new();
        for mode in ["full", "incremental", "replicate", "verify"] {
            if let Some(report) = store.load_json::<RunReport>("runs", &format!("{}.{}", source.id, mode))? {
                last_runs.push(report);
            }
        }
        last_runs.sort_by_key(|r| r.finished_at);

        sources.push(SourceStatus {
            source_id: source.id.clone(),
            generation: state.as_ref().map(|s| s.generation),
            baseline: state.as_ref().and_then(|s| s.baseline.clone()),
            last_artifact: state.as_ref().and_then(|s| s.last_artifact.clone()),
            committed_at: state.as_ref().and_then(|s| s.committed_at),
            artifacts: entries.len(),
            stored_bytes: entries.iter().map(|e| e.artifact.size_bytes).sum(),
            pending_mirrors: ledger.pending(&source.id)?,
            last_runs,
        });
    }

    let identity = config.handoff.identity_or(&config.engine.host_id);
    let handoff = match medium {
        Some(medium) => {
            let medium_available = medium.is_available();
            let marker = if medium_available { read_marker(medium.as_ref())? } else { None };
            Some(HandoffStatus {
                last_import: last_import(store.as_ref(), &identity)?,
                identity,
                medium_available,
                marker,
            })
        }
        None => None,
    };

    Ok(EngineStatus {
        host_id: config.engine.host_id.clone(),
        generated_at: Utc::now(),
        sources,
        retention_last_run: retention.last_run()?,
        handoff,
    })
}
