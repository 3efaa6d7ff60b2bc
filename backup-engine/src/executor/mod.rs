//! Backup run executor - Orchestrates one invocation of the engine.
//!
//! A backup run for one source goes:
//! run lock -> retry pending mirrors -> select primary -> build (blocking
//! pool) -> replicate -> optional handoff export -> automatic retention.
//! Other modes reuse the same pieces. Every run yields one [`RunReport`],
//! logged once and saved under `runs/`.

pub mod report;
pub mod status;
pub mod verify;

use crate::archive::naming::ArtifactKind;
use crate::archive::pack::{Archiver, Compression, PackArchiver};
use crate::archive::restore::Restorer;
use crate::archive::ArchiveBuilder;
use crate::config::{Config, RootConfig, SourceConfig};
use crate::daemon::lock::RunLock;
use crate::handoff::{HandoffExporter, HandoffImporter};
use crate::replication::{ReplicationCoordinator, ReplicationReport};
use crate::retention::RetentionManager;
use crate::snapshot::SnapshotTracker;
use crate::storage::{backend_for, DestinationSelector, RemovableBackend, StorageBackend};
use crate::store::{FsStateStore, StateStore, StoreExt};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use clap::ValueEnum;
pub use report::{RunOutcome, RunReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RUNS_NS: &str = "runs";
/// Lock owner for runs that span every source
const ENGINE_LOCK: &str = "engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Full,
    Incremental,
    /// Retry pending mirror deliveries without building
    Replicate,
    Retention,
    Status,
    Export,
    Import,
    Verify,
    Restore,
    /// Write the label file onto a removable medium
    LabelMedium,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Incremental => "incremental",
            Mode::Replicate => "replicate",
            Mode::Retention => "retention",
            Mode::Status => "status",
            Mode::Export => "export",
            Mode::Import => "import",
            Mode::Verify => "verify",
            Mode::Restore => "restore",
            Mode::LabelMedium => "label-medium",
        }
    }
}

/// Mode arguments from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Limit to one source (all sources when absent)
    pub source: Option<String>,
    /// Artifact to restore (latest when absent)
    pub artifact: Option<String>,
    /// Restore target, or the mount point to label
    pub target: Option<PathBuf>,
    pub medium_id: Option<String>,
}

pub struct Engine {
    config: Arc<Config>,
    store: Arc<dyn StateStore>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(config.engine.state_dir.join("store"))?);
        Ok(Self {
            config: Arc::new(config),
            store,
            cancel,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Run `mode`. Per-source modes produce one report per source.
    pub async fn run(&self, mode: Mode, request: &RunRequest) -> Vec<RunReport> {
        let reports = match mode {
            Mode::Full | Mode::Incremental | Mode::Replicate | Mode::Verify => {
                let sources = match self.selected_sources(request) {
                    Ok(sources) => sources,
                    Err(e) => return vec![self.finish(RunReport::new(mode.as_str(), None, Utc::now()).fail(&e))],
                };
                let mut reports = Vec::with_capacity(sources.len());
                for source in sources {
                    reports.push(self.run_source(mode, &source).await);
                }
                reports
            }
            _ => vec![self.run_engine(mode, request).await],
        };
        reports.into_iter().map(|r| self.finish(r)).collect()
    }

    async fn run_source(&self, mode: Mode, source: &SourceConfig) -> RunReport {
        let mut report = RunReport::new(mode.as_str(), Some(&source.id), Utc::now());
        let result = match mode {
            Mode::Full => self.backup(source, ArtifactKind::Full, &mut report).await,
            Mode::Incremental => self.backup(source, ArtifactKind::Incremental, &mut report).await,
            Mode::Replicate => self.replicate(source, &mut report).await,
            _ => self.verify(source, &mut report).await,
        };
        settle(report, result)
    }

    async fn run_engine(&self, mode: Mode, request: &RunRequest) -> RunReport {
        let mut report = RunReport::new(mode.as_str(), request.source.as_deref(), Utc::now());
        let result = match mode {
            Mode::Retention => self.retention(&mut report).await,
            Mode::Status => self.status(&mut report).await,
            Mode::Export => self.export(&mut report).await,
            Mode::Import => self.import(&mut report).await,
            Mode::Restore => self.restore(request, &mut report).await,
            _ => self.label_medium(request, &mut report),
        };
        settle(report, result)
    }

    fn finish(&self, report: RunReport) -> RunReport {
        report.log();
        if let Err(e) = self.store.save_json(RUNS_NS, &report.key(), &report) {
            warn!("Could not persist run report {}: {}", report.run_id, e);
        }
        report
    }

    fn selected_sources(&self, request: &RunRequest) -> Result<Vec<SourceConfig>> {
        match &request.source {
            Some(id) => Ok(vec![self.config.source(id)?.clone()]),
            None => Ok(self.config.sources.clone()),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.config.engine.state_dir.clone()
    }

    fn replication(&self) -> ReplicationCoordinator {
        ReplicationCoordinator::new(
            Arc::clone(&self.store),
            mirrors(&self.config),
            self.config.replication.max_parallel,
        )
    }

    async fn backup(&self, source: &SourceConfig, kind: ArtifactKind, report: &mut RunReport) -> Result<()> {
        let mode = if kind == ArtifactKind::Full { Mode::Full } else { Mode::Incremental };
        let _lock = RunLock::acquire(&self.state_dir(), &source.id, mode.as_str())?;
        info!(source = %source.id, "Starting {} backup", kind);

        // No baseline means nothing else may happen in this run
        if kind == ArtifactKind::Incremental {
            SnapshotTracker::new(Arc::clone(&self.store)).next_state(&source.id)?;
        }

        // Earlier artifacts' mirrors first
        let replication = self.replication();
        let retried = replication.retry_pending(&source.id, &self.cancel).await?;
        report.delivered.extend(retried.delivered);
        report.still_pending.extend(retried.pending);

        let destination = DestinationSelector::new(primaries(&self.config), self.config.destinations.min_free_bytes)
            .select()?;
        report.destination = Some(destination.id().to_string());

        let entry = {
            let store = Arc::clone(&self.store);
            let archiver = archiver(&self.config);
            let host = self.config.engine.host_id.clone();
            let source = source.clone();
            let mirror_ids = self.config.mirrors.iter().map(|m| m.id.clone()).collect();
            let cancel = self.cancel.clone();
            blocking(move || {
                ArchiveBuilder::new(store, archiver, &host)
                    .with_mirrors(mirror_ids)
                    .build(&source, kind, destination.as_ref(), &cancel)
            })
            .await?
        };
        report.artifact = Some(entry.id().to_string());

        absorb(report, replication.replicate(&entry, &self.cancel).await?);

        if self.config.handoff.enabled && self.config.handoff.export_after_backup {
            // The medium is often unplugged; that never fails a backup
            match self.run_export().await {
                Ok(export) => info!("Handoff export sequence {} written", export.sequence_number),
                Err(e) => warn!("Handoff export skipped: {}", e),
            }
        }

        self.auto_retention().await;
        Ok(())
    }

    async fn replicate(&self, source: &SourceConfig, report: &mut RunReport) -> Result<()> {
        let _lock = RunLock::acquire(&self.state_dir(), &source.id, Mode::Replicate.as_str())?;
        absorb(report, self.replication().retry_pending(&source.id, &self.cancel).await?);
        Ok(())
    }

    async fn verify(&self, source: &SourceConfig, report: &mut RunReport) -> Result<()> {
        let _lock = RunLock::acquire(&self.state_dir(), &source.id, Mode::Verify.as_str())?;
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let source_id = source.id.clone();
        let cancel = self.cancel.clone();

        let verified = blocking(move || {
            let mut verified = verify::verify_primaries(Arc::clone(&store), &source_id, &cancel)?;
            verified.mirror_failures = retention_manager(&config, store).reverify(&source_id)?;
            Ok(verified)
        })
        .await?;

        for (artifact, mirror) in &verified.mirror_failures {
            report
                .pending
                .push((artifact.clone(), mirror.clone(), "failed re-verification".into()));
        }
        report.details = Some(serde_json::to_value(&verified)?);

        if let Some((artifact, problem)) = verified.failures.first() {
            return Err(EngineError::integrity(
                format!("{}/{}", source.id, artifact),
                "catalog digest",
                format!("{} ({} artifact(s) failed)", problem, verified.failures.len()),
            ));
        }
        Ok(())
    }

    async fn retention(&self, report: &mut RunReport) -> Result<()> {
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let retained = blocking(move || {
            let _lock = RunLock::acquire(&config.engine.state_dir, ENGINE_LOCK, Mode::Retention.as_str())?;
            retention_manager(&config, store).run(&config.source_ids(), Utc::now())
        })
        .await?;

        for (artifact, mirror) in &retained.reverify_failures {
            report
                .pending
                .push((artifact.clone(), mirror.clone(), "failed re-verification".into()));
        }
        report.details = Some(serde_json::to_value(&retained)?);
        Ok(())
    }

    /// Retention after a backup, when the last pass is old enough. Failures
    /// are logged; they never change the backup's outcome.
    async fn auto_retention(&self) {
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let result = blocking(move || {
            let manager = retention_manager(&config, store);
            if !manager.is_due(Utc::now())? {
                return Ok(None);
            }
            let _lock = match RunLock::acquire(&config.engine.state_dir, ENGINE_LOCK, Mode::Retention.as_str()) {
                Ok(lock) => lock,
                Err(EngineError::LockContention { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            manager.run(&config.source_ids(), Utc::now()).map(Some)
        })
        .await;

        match result {
            Ok(Some(retained)) => info!("Automatic retention pruned {} artifact(s)", retained.pruned.len()),
            Ok(None) => debug!("Automatic retention not due"),
            Err(e) => warn!("Automatic retention failed: {}", e),
        }
    }

    async fn status(&self, report: &mut RunReport) -> Result<()> {
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let document = blocking(move || {
            let retention = retention_manager(&config, Arc::clone(&store));
            let medium = handoff_medium(&config).ok();
            status::collect(&config, store, &retention, medium)
        })
        .await?;
        report.details = Some(serde_json::to_value(&document)?);
        Ok(())
    }

    async fn run_export(&self) -> Result<crate::handoff::ExportReport> {
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        blocking(move || {
            if !config.handoff.enabled {
                return Err(EngineError::Config("handoff is not enabled".into()));
            }
            let _lock = RunLock::acquire(&config.engine.state_dir, "handoff", Mode::Export.as_str())?;
            let identity = config.handoff.identity_or(&config.engine.host_id);
            HandoffExporter::new(store, handoff_medium(&config)?, config.handoff.importers.clone(), &identity)
                .export(&config.source_ids(), &cancel)
        })
        .await
    }

    async fn export(&self, report: &mut RunReport) -> Result<()> {
        let exported = self.run_export().await?;
        report.destination = self.config.handoff.medium.as_ref().map(|p| p.display().to_string());
        report.details = Some(serde_json::to_value(&exported)?);
        Ok(())
    }

    async fn import(&self, report: &mut RunReport) -> Result<()> {
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        let (vault_id, imported) = blocking(move || {
            let _lock = RunLock::acquire(&config.engine.state_dir, "handoff", Mode::Import.as_str())?;
            let medium = handoff_medium(&config)?;
            let vault = DestinationSelector::new(primaries(&config), config.destinations.min_free_bytes).select()?;
            let identity = config.handoff.identity_or(&config.engine.host_id);
            let imported = HandoffImporter::new(store, Arc::clone(&medium), Arc::clone(&vault), &identity).import(&cancel)?;
            Ok((vault.id().to_string(), imported))
        })
        .await?;

        report.destination = Some(vault_id);
        report.details = Some(serde_json::to_value(&imported)?);
        if !imported.failed.is_empty() {
            let (artifact, reason) = &imported.failed[0];
            return Err(EngineError::integrity(
                artifact.as_str(),
                "manifest digest",
                format!("{} ({} of {} entries failed)", reason, imported.failed.len(), imported.failed.len() + imported.copied.len() + imported.already_present),
            ));
        }
        Ok(())
    }

    async fn restore(&self, request: &RunRequest, report: &mut RunReport) -> Result<()> {
        let source_id = match (&request.source, self.config.sources.as_slice()) {
            (Some(id), _) => self.config.source(id)?.id.clone(),
            (None, [only]) => only.id.clone(),
            (None, _) => return Err(EngineError::Config("restore needs --source when several sources are configured".into())),
        };
        let target = request
            .target
            .clone()
            .ok_or_else(|| EngineError::Config("restore needs --target".into()))?;
        report.source_id = Some(source_id.clone());

        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let artifact = request.artifact.clone();
        let cancel = self.cancel.clone();
        let restored = blocking(move || {
            let mut roots = primaries(&config);
            roots.extend(mirrors(&config));
            Restorer::new(store, roots).restore(&source_id, artifact.as_deref(), &target, &cancel)
        })
        .await?;

        report.artifact = restored.artifacts.last().cloned();
        report.details = Some(serde_json::to_value(&restored)?);
        Ok(())
    }

    fn label_medium(&self, request: &RunRequest, report: &mut RunReport) -> Result<()> {
        let path = request
            .target
            .clone()
            .or_else(|| self.config.handoff.medium.clone())
            .ok_or_else(|| EngineError::Config("label-medium needs --target or a handoff medium".into()))?;
        let medium_id = request
            .medium_id
            .clone()
            .or_else(|| {
                self.config
                    .destinations
                    .roots
                    .iter()
                    .chain(&self.config.mirrors)
                    .find(|r| r.path == path)
                    .and_then(|r| r.medium_id.clone())
            })
            .or_else(|| self.config.handoff.medium_id.clone())
            .ok_or_else(|| EngineError::Config("label-medium needs --medium-id".into()))?;

        RemovableBackend::initialize(&path, &medium_id)?;
        info!("Labelled {} as medium '{}'", path.display(), medium_id);
        report.destination = Some(path.display().to_string());
        Ok(())
    }
}

fn settle(report: RunReport, result: Result<()>) -> RunReport {
    match result {
        Ok(()) => report.succeed(),
        Err(e) => report.fail(&e),
    }
}

fn absorb(report: &mut RunReport, replicated: ReplicationReport) {
    report.delivered.extend(replicated.delivered);
    report.pending.extend(replicated.pending);
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(format!("worker task failed: {e}"))))?
}

fn root_backend(root: &RootConfig) -> Arc<dyn StorageBackend> {
    backend_for(&root.id, &root.path, root.removable, root.medium_id.as_deref())
}

fn primaries(config: &Config) -> Vec<Arc<dyn StorageBackend>> {
    config.destinations.roots.iter().map(root_backend).collect()
}

fn mirrors(config: &Config) -> Vec<Arc<dyn StorageBackend>> {
    config.mirrors.iter().map(root_backend).collect()
}

fn handoff_medium(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let path = config
        .handoff
        .medium
        .as_ref()
        .ok_or_else(|| EngineError::Config("no handoff medium configured".into()))?;
    Ok(Arc::new(RemovableBackend::new("handoff", path, config.handoff.medium_id.clone())))
}

fn archiver(config: &Config) -> Arc<dyn Archiver> {
    let compression = match config.archive.compression.as_str() {
        "none" => Compression::None,
        _ => Compression::Zstd {
            level: config.archive.compression_level,
        },
    };
    Arc::new(PackArchiver::new(compression))
}

fn retention_manager(config: &Config, store: Arc<dyn StateStore>) -> RetentionManager {
    let handoff = &config.handoff;
    let manager = RetentionManager::new(store, config.retention.clone(), mirrors(config)).with_dedup(config.dedup.clone());
    if handoff.enabled {
        manager.with_handoff(handoff_medium(config).ok(), handoff.importers.clone())
    } else {
        manager
    }
}
