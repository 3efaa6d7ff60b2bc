//! `verify`: re-hash every cataloged artifact where it was committed.

use crate::dedup;
use crate::integrity;
use crate::store::catalog::ArtifactCatalog;
use crate::store::StateStore;
use crate::utils::errors::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    /// Primary copies replaced by a dedup delta
    pub delta_backed: usize,
    /// Artifacts whose primary root is not mounted
    pub unreachable: usize,
    /// (artifact, problem)
    pub failures: Vec<(String, String)>,
    /// (artifact, mirror) copies that failed re-verification
    pub mirror_failures: Vec<(String, String)>,
}

pub fn verify_primaries(store: Arc<dyn StateStore>, source_id: &str, cancel: &CancellationToken) -> Result<VerifyReport> {
    let catalog = ArtifactCatalog::new(Arc::clone(&store));
    let mut report = VerifyReport::default();

    for entry in catalog.list(source_id)? {
        if cancel.is_cancelled() {
            return Err(crate::utils::errors::EngineError::Cancelled);
        }
        if !entry.root.is_dir() {
            report.unreachable += 1;
            continue;
        }

        let path = entry.path();
        if path.is_file() {
            let actual = integrity::hash_file(&path)?;
            if actual == entry.artifact.content_hash {
                report.checked += 1;
            } else {
                error!(
                    artifact = %entry.id(),
                    "Primary copy {} fails its digest ({} != {})",
                    path.display(),
                    actual.short(),
                    entry.artifact.content_hash.short()
                );
                report
                    .failures
                    .push((entry.id().to_string(), format!("digest mismatch: {actual}")));
            }
        } else if dedup::load_delta_ref(store.as_ref(), source_id, entry.id())?.is_some() {
            report.delta_backed += 1;
        } else {
            error!(artifact = %entry.id(), "Primary copy {} is missing", path.display());
            report.failures.push((entry.id().to_string(), "missing".into()));
        }
    }

    info!(
        source = %source_id,
        "Verified {} artifact(s); {} delta-backed, {} unreachable, {} failed",
        report.checked,
        report.delta_backed,
        report.unreachable,
        report.failures.len()
    );
    Ok(report)
}
