//! End-to-end runs through the engine, one scenario per behaviour.

use backup_engine::archive::naming::ArtifactKind;
use backup_engine::archive::pack::{Compression, PackArchiver};
use backup_engine::archive::ArchiveBuilder;
use backup_engine::config::{Config, DestinationsConfig, RootConfig, SourceConfig};
use backup_engine::daemon::lock::RunLock;
use backup_engine::integrity;
use backup_engine::snapshot::SnapshotTracker;
use backup_engine::storage::{LocalBackend, RemovableBackend};
use backup_engine::store::catalog::ArtifactCatalog;
use backup_engine::store::ledger::DeliveryLedger;
use backup_engine::{Engine, EngineError, Mode, RunOutcome, RunRequest};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Set in a child copy of this test binary that only holds a run lock.
const HOLD_LOCK_ENV: &str = "BACKUP_ENGINE_TEST_HOLD_LOCK";

struct Site {
    _dirs: Vec<TempDir>,
    source: PathBuf,
    primary: PathBuf,
    mirror: PathBuf,
    scratch: PathBuf,
    config: Config,
}

fn site() -> Site {
    let dirs: Vec<TempDir> = (0..5).map(|_| TempDir::new().unwrap()).collect();
    let source = dirs[0].path().to_path_buf();
    let state = dirs[1].path().to_path_buf();
    let primary = dirs[2].path().to_path_buf();
    let mirror = dirs[3].path().to_path_buf();
    let scratch = dirs[4].path().to_path_buf();

    fs::create_dir_all(source.join("docs")).unwrap();
    fs::write(source.join("docs/readme.txt"), b"first version").unwrap();
    fs::write(source.join("notes.txt"), b"keep me").unwrap();
    fs::write(source.join("obsolete.txt"), b"delete me later").unwrap();

    let mut config = Config::default();
    config.engine.host_id = "vault01".into();
    config.engine.state_dir = state;
    config.sources.push(SourceConfig {
        id: "projects".into(),
        path: source.clone(),
        exclude: Vec::new(),
    });
    config.destinations = DestinationsConfig {
        min_free_bytes: 0,
        roots: vec![RootConfig {
            id: "primary".into(),
            path: primary.clone(),
            removable: false,
            medium_id: None,
        }],
    };
    config.mirrors.push(RootConfig {
        id: "usb-mirror".into(),
        path: mirror.clone(),
        removable: true,
        medium_id: Some("mirror-01".into()),
    });
    config.validate().unwrap();

    Site {
        _dirs: dirs,
        source,
        primary,
        mirror,
        scratch,
        config,
    }
}

fn engine(site: &Site) -> Engine {
    Engine::new(site.config.clone(), CancellationToken::new()).unwrap()
}

fn plug_in_mirror(site: &Site) {
    RemovableBackend::initialize(&site.mirror, "mirror-01").unwrap();
}

fn tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

fn artifacts_on(primary: &Path) -> usize {
    fs::read_dir(primary.join("projects"))
        .map(|dir| {
            dir.filter_map(|e| e.ok())
                .filter(|e| {
                    let name = e.file_name().to_string_lossy().to_string();
                    name.ends_with(".pack.zst")
                })
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn incremental_without_baseline_is_a_configuration_error() {
    let site = site();
    let reports = engine(&site).run(Mode::Incremental, &RunRequest::default()).await;

    assert_eq!(reports[0].outcome, RunOutcome::Failed);
    assert_eq!(reports[0].exit_code, 2);
    assert_eq!(artifacts_on(&site.primary), 0);
}

#[tokio::test]
async fn committed_artifacts_match_their_digest() {
    let site = site();
    plug_in_mirror(&site);
    let engine = engine(&site);
    engine.run(Mode::Full, &RunRequest::default()).await;
    fs::write(site.source.join("notes.txt"), b"changed").unwrap();
    engine.run(Mode::Incremental, &RunRequest::default()).await;

    let catalog = ArtifactCatalog::new(engine.store());
    let entries = catalog.list("projects").unwrap();
    assert_eq!(entries.len(), 2);
    for entry in entries {
        let path = entry.path();
        assert_eq!(integrity::hash_file(&path).unwrap(), entry.artifact.content_hash);
        assert_eq!(integrity::read_sidecar(&path).unwrap(), entry.artifact.content_hash);
        let mirrored = site.mirror.join(&entry.rel_path);
        assert_eq!(integrity::hash_file(&mirrored).unwrap(), entry.artifact.content_hash);
    }
}

#[tokio::test]
async fn unchanged_tree_yields_empty_incremental() {
    let site = site();
    plug_in_mirror(&site);
    let engine = engine(&site);
    engine.run(Mode::Full, &RunRequest::default()).await;
    fs::write(site.source.join("notes.txt"), b"changed once").unwrap();
    engine.run(Mode::Incremental, &RunRequest::default()).await;
    let reports = engine.run(Mode::Incremental, &RunRequest::default()).await;

    assert_eq!(reports[0].outcome, RunOutcome::Success);
    let id = reports[0].artifact.clone().unwrap();
    let entry = ArtifactCatalog::new(engine.store()).get("projects", &id).unwrap().unwrap();
    assert_eq!(entry.artifact.generation, 2);
    assert_eq!(entry.artifact.stats.files, 0);
    assert_eq!(entry.artifact.stats.removed, 0);
}

#[tokio::test]
async fn full_then_incremental_restores_mutated_tree() {
    let site = site();
    plug_in_mirror(&site);
    let engine = engine(&site);

    // A few megabytes with a mutation in the middle of one file
    let big: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    fs::write(site.source.join("data.bin"), &big).unwrap();
    let full = engine.run(Mode::Full, &RunRequest::default()).await;
    assert_eq!(full[0].outcome, RunOutcome::Success);

    let mut mutated = big.clone();
    for byte in &mut mutated[1024 * 1024..2 * 1024 * 1024] {
        *byte = byte.wrapping_add(7);
    }
    mutated.extend_from_slice(b"tail");
    fs::write(site.source.join("data.bin"), &mutated).unwrap();
    fs::remove_file(site.source.join("obsolete.txt")).unwrap();
    fs::write(site.source.join("docs/new.txt"), b"added").unwrap();

    let incr = engine.run(Mode::Incremental, &RunRequest::default()).await;
    assert_eq!(incr[0].outcome, RunOutcome::Success);
    let incr_id = incr[0].artifact.clone().unwrap();
    let incr_entry = ArtifactCatalog::new(engine.store()).get("projects", &incr_id).unwrap().unwrap();
    assert_eq!(incr_entry.artifact.parent, full[0].artifact);
    assert_eq!(Some(incr_entry.artifact.baseline.clone()), full[0].artifact);

    let target = site.scratch.join("restored");
    let restored = engine
        .run(
            Mode::Restore,
            &RunRequest {
                target: Some(target.clone()),
                ..RunRequest::default()
            },
        )
        .await;
    assert_eq!(restored[0].outcome, RunOutcome::Success);
    assert_eq!(tree(&target), tree(&site.source));
}

#[tokio::test]
async fn unreachable_mirror_is_retried_without_rebuilding() {
    let site = site();
    let engine = engine(&site);

    let first = engine.run(Mode::Full, &RunRequest::default()).await;
    assert_eq!(first[0].outcome, RunOutcome::SuccessWithPendingMirror);
    assert_eq!(first[0].exit_code, 10);
    let artifact = first[0].artifact.clone().unwrap();
    let ledger = DeliveryLedger::new(engine.store());
    assert_eq!(ledger.pending("projects").unwrap().len(), 1);

    plug_in_mirror(&site);
    let retry = engine.run(Mode::Replicate, &RunRequest::default()).await;

    assert_eq!(retry[0].outcome, RunOutcome::Success);
    assert_eq!(retry[0].delivered, vec![(artifact.clone(), "usb-mirror".to_string())]);
    assert!(ledger.pending("projects").unwrap().is_empty());
    assert_eq!(artifacts_on(&site.primary), 1);
    assert!(site.mirror.join("projects").join(&artifact).is_file());
}

#[tokio::test]
async fn retention_keeps_artifacts_missing_a_delivery() {
    let mut site = site();
    site.config.retention.keep_days = 0;
    site.config.retention.keep_count = 1;
    let engine = engine(&site);

    // Mirror unplugged for both runs: nothing is resolved
    engine.run(Mode::Full, &RunRequest::default()).await;
    engine.run(Mode::Full, &RunRequest::default()).await;
    let reports = engine.run(Mode::Retention, &RunRequest::default()).await;

    assert_eq!(reports[0].outcome, RunOutcome::Success);
    assert_eq!(artifacts_on(&site.primary), 2);

    // Delivered now; the older chain may go
    plug_in_mirror(&site);
    engine.run(Mode::Replicate, &RunRequest::default()).await;
    engine.run(Mode::Retention, &RunRequest::default()).await;
    assert_eq!(artifacts_on(&site.primary), 1);
    assert_eq!(ArtifactCatalog::new(engine.store()).list("projects").unwrap().len(), 1);
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !path.exists() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Runs only inside the child spawned by `full_run_held_by_another_process_is_skipped`.
#[test]
fn hold_full_lock_until_released() {
    let Ok(dir) = std::env::var(HOLD_LOCK_ENV) else {
        return;
    };
    let dir = PathBuf::from(dir);
    let state_dir = fs::read_to_string(dir.join("state_dir")).unwrap();
    let _held = RunLock::acquire(Path::new(&state_dir), "projects", "full").unwrap();
    fs::write(dir.join("held"), b"").unwrap();
    wait_for(&dir.join("release"));
}

#[tokio::test]
async fn full_run_held_by_another_process_is_skipped() {
    let site = site();
    let engine = engine(&site);
    let handshake = site.scratch.join("handshake");
    fs::create_dir_all(&handshake).unwrap();
    fs::write(
        handshake.join("state_dir"),
        site.config.engine.state_dir.to_string_lossy().as_bytes(),
    )
    .unwrap();

    let mut child = Command::new(std::env::current_exe().unwrap())
        .args(["hold_full_lock_until_released", "--exact", "--nocapture"])
        .env(HOLD_LOCK_ENV, &handshake)
        .spawn()
        .unwrap();
    wait_for(&handshake.join("held"));

    let reports = engine.run(Mode::Full, &RunRequest::default()).await;
    assert_eq!(reports[0].outcome, RunOutcome::Skipped);
    assert_eq!(reports[0].exit_code, 5);
    assert_eq!(artifacts_on(&site.primary), 0);

    fs::write(handshake.join("release"), b"").unwrap();
    assert!(child.wait().unwrap().success());

    // The kernel released the lock with the child
    let reports = engine.run(Mode::Full, &RunRequest::default()).await;
    assert_ne!(reports[0].outcome, RunOutcome::Skipped);
    assert_eq!(artifacts_on(&site.primary), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_engines_on_one_state_dir_stay_consistent() {
    let site = site();
    plug_in_mirror(&site);
    let first = engine(&site);
    let second = engine(&site);

    let request = RunRequest::default();
    let (a, b) = tokio::join!(first.run(Mode::Full, &request), second.run(Mode::Full, &request));
    let outcomes = [a[0].outcome, b[0].outcome];

    let built = outcomes.iter().filter(|o| **o != RunOutcome::Skipped).count();
    assert!(built >= 1);
    for outcome in outcomes {
        assert!(matches!(outcome, RunOutcome::Success | RunOutcome::Skipped), "{outcome:?}");
    }
    // Every run that got the lock produced exactly one artifact, and the
    // shared catalog agrees with the primary
    assert_eq!(artifacts_on(&site.primary), built);
    let entries = ArtifactCatalog::new(first.store()).list("projects").unwrap();
    assert_eq!(entries.len(), built);
    let state = SnapshotTracker::new(first.store()).current("projects").unwrap().unwrap();
    assert!(entries.iter().any(|e| Some(e.id()) == state.last_artifact.as_deref()));
}

#[tokio::test]
async fn cancelled_backup_commits_nothing() {
    let site = site();
    plug_in_mirror(&site);
    engine(&site).run(Mode::Full, &RunRequest::default()).await;
    let tracker = SnapshotTracker::new(engine(&site).store());
    let before = tracker.current("projects").unwrap().unwrap();
    fs::write(site.source.join("notes.txt"), b"changed").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let cancelled = Engine::new(site.config.clone(), cancel).unwrap();
    let reports = cancelled.run(Mode::Incremental, &RunRequest::default()).await;

    assert_eq!(reports[0].outcome, RunOutcome::Failed);
    assert_eq!(artifacts_on(&site.primary), 1);
    assert_eq!(ArtifactCatalog::new(cancelled.store()).list("projects").unwrap().len(), 1);
    let after = tracker.current("projects").unwrap().unwrap();
    assert_eq!(after.generation, before.generation);
    assert_eq!(after.last_artifact, before.last_artifact);
    let leftovers: Vec<_> = walkdir::WalkDir::new(&site.primary)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn missing_baseline_is_reported_before_destination_problems() {
    let mut site = site();
    site.config.destinations.roots[0].path = site.scratch.join("not-mounted");
    let reports = engine(&site).run(Mode::Incremental, &RunRequest::default()).await;

    assert_eq!(reports[0].outcome, RunOutcome::Failed);
    assert_eq!(reports[0].exit_code, 2);
    assert!(reports[0].destination.is_none());
}

#[tokio::test]
async fn artifact_committed_before_a_crash_still_reaches_its_mirror() {
    let site = site();
    let engine = engine(&site);

    // Build and commit, then stop as if killed before replication started
    let primary = LocalBackend::new("primary", &site.primary);
    let entry = ArchiveBuilder::new(
        engine.store(),
        Arc::new(PackArchiver::new(Compression::Zstd { level: 3 })),
        "vault01",
    )
    .with_mirrors(vec!["usb-mirror".to_string()])
    .build(&site.config.sources[0], ArtifactKind::Full, &primary, &CancellationToken::new())
    .unwrap();
    let ledger = DeliveryLedger::new(engine.store());
    assert_eq!(ledger.pending_for("projects", entry.id()).unwrap().len(), 1);

    plug_in_mirror(&site);
    let retry = engine.run(Mode::Replicate, &RunRequest::default()).await;

    assert_eq!(retry[0].outcome, RunOutcome::Success);
    assert_eq!(retry[0].delivered, vec![(entry.id().to_string(), "usb-mirror".to_string())]);
    assert!(ledger.pending("projects").unwrap().is_empty());
    let mirrored = site.mirror.join(&entry.rel_path);
    assert_eq!(integrity::hash_file(&mirrored).unwrap(), entry.artifact.content_hash);
}

#[tokio::test]
async fn rotten_mirror_copy_is_reported_and_redelivered() {
    let site = site();
    plug_in_mirror(&site);
    let engine = engine(&site);
    let full = engine.run(Mode::Full, &RunRequest::default()).await;
    assert_eq!(full[0].outcome, RunOutcome::Success);
    let artifact = full[0].artifact.clone().unwrap();
    let entry = ArtifactCatalog::new(engine.store()).get("projects", &artifact).unwrap().unwrap();
    let mirrored = site.mirror.join(&entry.rel_path);
    fs::write(&mirrored, b"bit rot").unwrap();

    let verified = engine.run(Mode::Verify, &RunRequest::default()).await;

    assert_eq!(verified[0].outcome, RunOutcome::SuccessWithPendingMirror);
    assert_eq!(verified[0].exit_code, 10);
    assert_eq!(verified[0].pending.len(), 1);
    assert_eq!(verified[0].pending[0].0, artifact);
    assert_eq!(verified[0].pending[0].1, "usb-mirror");
    let ledger = DeliveryLedger::new(engine.store());
    assert!(!ledger
        .is_delivered("projects", &artifact, "usb-mirror", &entry.artifact.content_hash)
        .unwrap());
    assert_eq!(ledger.pending_for("projects", &artifact).unwrap().len(), 1);

    let retry = engine.run(Mode::Replicate, &RunRequest::default()).await;
    assert_eq!(retry[0].outcome, RunOutcome::Success);
    assert_eq!(integrity::hash_file(&mirrored).unwrap(), entry.artifact.content_hash);
}

#[tokio::test]
async fn handoff_waits_for_every_importer() {
    let mut producer = site();
    plug_in_mirror(&producer);
    let medium = TempDir::new().unwrap();
    RemovableBackend::initialize(medium.path(), "handoff-01").unwrap();
    producer.config.handoff.enabled = true;
    producer.config.handoff.medium = Some(medium.path().to_path_buf());
    producer.config.handoff.medium_id = Some("handoff-01".into());
    producer.config.handoff.importers = vec!["work".into(), "home".into()];
    let producer_engine = engine(&producer);

    producer_engine.run(Mode::Full, &RunRequest::default()).await;
    let export = producer_engine.run(Mode::Export, &RunRequest::default()).await;
    assert_eq!(export[0].outcome, RunOutcome::Success);

    let importer = |identity: &str| {
        let mut side = site();
        side.config.handoff = producer.config.handoff.clone();
        side.config.handoff.identity = Some(identity.to_string());
        side.config.mirrors.clear();
        side
    };

    let work = importer("work");
    let imported = engine(&work).run(Mode::Import, &RunRequest::default()).await;
    assert_eq!(imported[0].outcome, RunOutcome::Success);
    assert_eq!(artifacts_on(&work.primary), 1);

    // One acknowledgement is not enough
    producer_engine.run(Mode::Export, &RunRequest::default()).await;
    let on_medium = medium.path().join("handoff/artifacts/projects");
    assert_eq!(fs::read_dir(&on_medium).unwrap().count(), 3);

    let home = importer("home");
    engine(&home).run(Mode::Import, &RunRequest::default()).await;
    producer_engine.run(Mode::Export, &RunRequest::default()).await;
    let left = fs::read_dir(&on_medium).map(|d| d.count()).unwrap_or(0);
    assert_eq!(left, 0);
}

#[test]
fn lock_contention_maps_to_its_exit_code() {
    assert_eq!(EngineError::LockContention { key: "x".into() }.exit_code(), 5);
}
