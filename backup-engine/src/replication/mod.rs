//! Replication Coordinator.
//!
//! Pushes a committed artifact to every configured mirror in parallel
//! (bounded by `max_parallel`). A mirror that fails for any reason gets a
//! durable [`PendingMirror`] marker instead of failing the run; the primary
//! copy is already safe. [`ReplicationCoordinator::retry_pending`] drains
//! those markers on later runs.

pub mod delivery;

use crate::storage::StorageBackend;
use crate::store::catalog::{ArtifactCatalog, CatalogEntry};
use crate::store::ledger::{DeliveryLedger, DeliveryRecord, PendingMirror};
use crate::store::StateStore;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    /// (artifact, mirror) pairs confirmed in this pass
    pub delivered: Vec<(String, String)>,
    /// (artifact, mirror, reason) pairs left pending
    pub pending: Vec<(String, String, String)>,
}

impl ReplicationReport {
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn merge(&mut self, other: ReplicationReport) {
        self.delivered.extend(other.delivered);
        self.pending.extend(other.pending);
    }
}

pub struct ReplicationCoordinator {
    mirrors: Vec<Arc<dyn StorageBackend>>,
    ledger: DeliveryLedger,
    catalog: ArtifactCatalog,
    max_parallel: usize,
}

impl ReplicationCoordinator {
    pub fn new(store: Arc<dyn StateStore>, mirrors: Vec<Arc<dyn StorageBackend>>, max_parallel: usize) -> Self {
        Self {
            mirrors,
            ledger: DeliveryLedger::new(Arc::clone(&store)),
            catalog: ArtifactCatalog::new(store),
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn mirrors(&self) -> &[Arc<dyn StorageBackend>] {
        &self.mirrors
    }

    /// Deliver a freshly committed artifact to every mirror.
    pub async fn replicate(&self, entry: &CatalogEntry, cancel: &CancellationToken) -> Result<ReplicationReport> {
        if self.mirrors.is_empty() {
            return Ok(ReplicationReport::default());
        }
        let jobs = self
            .mirrors
            .iter()
            .map(|mirror| (Arc::clone(mirror), entry.clone()))
            .collect();
        self.run_jobs(jobs, cancel).await
    }

    /// Re-attempt every pending mirror of `source_id`.
    pub async fn retry_pending(&self, source_id: &str, cancel: &CancellationToken) -> Result<ReplicationReport> {
        let markers = self.ledger.pending(source_id)?;
        if markers.is_empty() {
            return Ok(ReplicationReport::default());
        }
        info!(source = %source_id, "Retrying {} pending mirror deliveries", markers.len());

        let mut jobs = Vec::with_capacity(markers.len());
        for marker in markers {
            let Some(mirror) = self.mirrors.iter().find(|m| m.id() == marker.mirror_id) else {
                warn!(
                    artifact = %marker.artifact_id,
                    "Mirror '{}' is no longer configured; dropping its pending marker",
                    marker.mirror_id
                );
                self.ledger
                    .clear_pending(source_id, &marker.artifact_id, &marker.mirror_id)?;
                continue;
            };
            let Some(entry) = self.catalog.get(source_id, &marker.artifact_id)? else {
                warn!(artifact = %marker.artifact_id, "Pending artifact is no longer in the catalog");
                self.ledger
                    .clear_pending(source_id, &marker.artifact_id, &marker.mirror_id)?;
                continue;
            };
            jobs.push((Arc::clone(mirror), entry));
        }

        self.run_jobs(jobs, cancel).await
    }

    /// Retry pending deliveries for several sources.
    pub async fn retry_all(&self, source_ids: &[String], cancel: &CancellationToken) -> Result<ReplicationReport> {
        let mut report = ReplicationReport::default();
        for source_id in source_ids {
            report.merge(self.retry_pending(source_id, cancel).await?);
        }
        Ok(report)
    }

    async fn run_jobs(
        &self,
        jobs: Vec<(Arc<dyn StorageBackend>, CatalogEntry)>,
        cancel: &CancellationToken,
    ) -> Result<ReplicationReport> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();
        // Jobs not yet reported back; whatever is left after joining panicked
        let mut outstanding: Vec<Option<(String, CatalogEntry)>> = Vec::with_capacity(jobs.len());

        for (index, (mirror, entry)) in jobs.into_iter().enumerate() {
            outstanding.push(Some((mirror.id().to_string(), entry.clone())));
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    _ if cancel.is_cancelled() => Err(EngineError::MirrorPending {
                        mirror: mirror.id().to_string(),
                        reason: "run cancelled before delivery".into(),
                    }),
                    Ok(_permit) => {
                        let worker_mirror = Arc::clone(&mirror);
                        let worker_entry = entry.clone();
                        tokio::task::spawn_blocking(move || {
                            delivery::deliver(worker_mirror.as_ref(), &worker_entry.path(), &worker_entry.artifact)
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(EngineError::MirrorPending {
                                mirror: mirror.id().to_string(),
                                reason: format!("delivery task failed: {e}"),
                            })
                        })
                    }
                    Err(e) => Err(EngineError::MirrorPending {
                        mirror: mirror.id().to_string(),
                        reason: format!("worker pool closed: {e}"),
                    }),
                };
                (index, outcome)
            });
        }

        let mut report = ReplicationReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Replication task panicked: {}", e);
                    continue;
                }
            };
            let Some((mirror_id, entry)) = outstanding.get_mut(index).and_then(Option::take) else {
                continue;
            };

            match outcome {
                Ok(record) => self.confirm(&entry, &mirror_id, record, &mut report),
                Err(err) => {
                    let reason = match &err {
                        EngineError::MirrorPending { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    self.leave_pending(&entry, &mirror_id, reason, &mut report);
                }
            }
        }

        for (mirror_id, entry) in outstanding.into_iter().flatten() {
            self.leave_pending(&entry, &mirror_id, "replication task panicked".into(), &mut report);
        }

        Ok(report)
    }

    /// Record a verified delivery. If the ledger cannot take it, the delivery
    /// stays pending and is re-verified on the next retry.
    fn confirm(&self, entry: &CatalogEntry, mirror_id: &str, record: DeliveryRecord, report: &mut ReplicationReport) {
        let source_id = &entry.artifact.source_id;
        let artifact_id = &entry.artifact.id;
        let recorded = self
            .ledger
            .record(source_id, record)
            .and_then(|()| self.ledger.clear_pending(source_id, artifact_id, mirror_id));
        match recorded {
            Ok(()) => {
                info!(artifact = %artifact_id, "Delivery to mirror '{}' confirmed", mirror_id);
                report.delivered.push((artifact_id.clone(), mirror_id.to_string()));
            }
            Err(e) => self.leave_pending(entry, mirror_id, format!("delivered but not recorded: {e}"), report),
        }
    }

    fn leave_pending(&self, entry: &CatalogEntry, mirror_id: &str, reason: String, report: &mut ReplicationReport) {
        let source_id = &entry.artifact.source_id;
        let artifact_id = &entry.artifact.id;
        warn!(artifact = %artifact_id, "Mirror '{}' pending: {}", mirror_id, reason);
        let now = Utc::now();
        let marked = self.ledger.mark_pending(PendingMirror {
            source_id: source_id.clone(),
            artifact_id: artifact_id.clone(),
            mirror_id: mirror_id.to_string(),
            primary_path: entry.path(),
            content_hash: entry.artifact.content_hash,
            attempts: 1,
            last_error: reason.clone(),
            since: now,
            last_attempt: now,
        });
        if let Err(e) = marked {
            // A marker queued at commit time may still be there
            error!(artifact = %artifact_id, "Could not record pending mirror '{}': {}", mirror_id, e);
        }
        report.pending.push((artifact_id.clone(), mirror_id.to_string(), reason));
    }
}
