use async_trait::async_trait;
use ingest_coordinator::{
    BatchCoordinator, BatchRecord, BatchSession, BatchStatus, CompletedPart, CoordinatorConfig,
    CoordinatorError, DiscoveryMode, FileStatus, FsStateStore, JobQueue, MemoryJobQueue,
    MemoryStateStore, NewFile, StateStore, TrackedFile, UploadKind,
};
use ingest_discovery::{build, DiscoveryConfig, DiscoveryProcessor, Phase, StepLimits};
use ingest_protocol::{manifest_key, DiscoveryJob};
use ingest_store::{EntityClient, MemoryBlobStore, MemoryEntityStore, RetryPolicy};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Job queue that rejects its first `failures` sends.
#[derive(Default)]
struct FlakyQueue {
    failures: AtomicUsize,
    delivered: MemoryJobQueue,
}

impl FlakyQueue {
    fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn jobs(&self) -> Vec<DiscoveryJob> {
        self.delivered.jobs()
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn send(&self, job: DiscoveryJob) -> ingest_coordinator::Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoordinatorError::Queue("downstream unavailable".into()));
        }
        self.delivered.send(job).await
    }
}

struct Harness {
    coordinator: Arc<BatchCoordinator>,
    entities: Arc<MemoryEntityStore>,
    blobs: Arc<MemoryBlobStore>,
    queue: Arc<FlakyQueue>,
    state: Arc<dyn StateStore>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(1, 4, 3)
}

fn discovery_config() -> DiscoveryConfig {
    DiscoveryConfig {
        async_limits: StepLimits {
            files: 1,
            chunks: 2,
            directories: 1,
        },
        ..DiscoveryConfig::default()
    }
}

fn harness_with(config: CoordinatorConfig, state: Arc<dyn StateStore>) -> Harness {
    let entities = Arc::new(MemoryEntityStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let queue = Arc::new(FlakyQueue::default());
    let discovery = discovery_config();
    let processor = DiscoveryProcessor::new(
        EntityClient::new(entities.clone(), fast_retry()),
        blobs.clone(),
        &discovery,
    )
    .unwrap();
    let coordinator = BatchCoordinator::new(
        config,
        discovery,
        Arc::new(processor),
        state.clone(),
        queue.clone(),
    )
    .unwrap();
    Harness {
        coordinator: Arc::new(coordinator),
        entities,
        blobs,
        queue,
        state,
    }
}

fn harness(config: CoordinatorConfig) -> Harness {
    harness_with(config, Arc::new(MemoryStateStore::new()))
}

fn sync_config() -> CoordinatorConfig {
    CoordinatorConfig {
        step_retry: fast_retry(),
        ..CoordinatorConfig::default()
    }
}

fn async_config() -> CoordinatorConfig {
    CoordinatorConfig {
        step_retry: fast_retry(),
        sync_max_files: 0,
        sync_max_text_files: 0,
        ..CoordinatorConfig::default()
    }
}

fn text_file(batch_id: &str, path: &str) -> NewFile {
    NewFile {
        r2_key: format!("staging/{batch_id}{path}"),
        logical_path: path.to_string(),
        file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
        file_size: 16,
        content_type: "text/markdown".into(),
        upload: UploadKind::Simple,
    }
}

/// Register, upload and complete every path; returns the batch manifest.
async fn uploaded_batch(h: &Harness, batch_id: &str, paths: &[&str]) -> BatchRecord {
    h.coordinator
        .init(batch_id, BatchSession::default())
        .await
        .unwrap();
    for path in paths {
        let file = text_file(batch_id, path);
        h.blobs
            .insert(file.r2_key.clone(), format!("notes for {path}").into_bytes());
        let r2_key = file.r2_key.clone();
        h.coordinator.add_file(batch_id, file).await.unwrap();
        h.coordinator
            .complete_file(batch_id, &r2_key, Vec::new())
            .await
            .unwrap();
    }
    h.coordinator.get_state(batch_id).await.unwrap()
}

async fn wait_for_status(h: &Harness, batch_id: &str, status: BatchStatus) -> BatchRecord {
    for _ in 0..500 {
        let record = h.coordinator.get_state(batch_id).await.unwrap();
        if record.status == status {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {batch_id} never reached {status}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_add_file_keeps_every_file() {
    let h = harness(sync_config());
    h.coordinator
        .init("b-concurrent", BatchSession::default())
        .await
        .unwrap();

    let mut tasks = JoinSet::new();
    for i in 0..16 {
        let coordinator = h.coordinator.clone();
        tasks.spawn(async move {
            coordinator
                .add_file("b-concurrent", text_file("b-concurrent", &format!("/docs/f{i}.md")))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let record = h.coordinator.get_state("b-concurrent").await.unwrap();
    assert_eq!(record.files.len(), 16);

    let persisted = h.state.load("b-concurrent").await.unwrap().unwrap();
    assert_eq!(persisted.files.len(), 16);
}

#[tokio::test]
async fn complete_file_is_idempotent() {
    let h = harness(sync_config());
    h.coordinator.init("b1", BatchSession::default()).await.unwrap();
    let file = text_file("b1", "/a.md");
    let key = file.r2_key.clone();
    h.coordinator.add_file("b1", file).await.unwrap();

    let first = h.coordinator.complete_file("b1", &key, Vec::new()).await.unwrap();
    let second = h.coordinator.complete_file("b1", &key, Vec::new()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.status, FileStatus::Completed);

    let missing = h.coordinator.complete_file("b1", "nope", Vec::new()).await;
    assert!(matches!(missing, Err(CoordinatorError::FileNotFound { .. })));
}

#[tokio::test]
async fn duplicate_announcement_replaces_the_entry() {
    let h = harness(sync_config());
    h.coordinator.init("b1", BatchSession::default()).await.unwrap();
    h.coordinator.add_file("b1", text_file("b1", "/a.md")).await.unwrap();
    let mut again = text_file("b1", "/a.md");
    again.file_size = 99;
    h.coordinator.add_file("b1", again).await.unwrap();

    let record = h.coordinator.get_state("b1").await.unwrap();
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.files[0].file_size, 99);
}

#[tokio::test]
async fn unknown_and_duplicate_batches_are_rejected() {
    let h = harness(sync_config());
    assert!(matches!(
        h.coordinator.get_state("ghost").await,
        Err(CoordinatorError::BatchNotFound(_))
    ));
    assert!(matches!(
        h.coordinator.get_state("../ghost").await,
        Err(CoordinatorError::InvalidBatchId(_))
    ));

    h.coordinator.init("b1", BatchSession::default()).await.unwrap();
    assert!(matches!(
        h.coordinator.init("b1", BatchSession::default()).await,
        Err(CoordinatorError::BatchExists(_))
    ));
}

#[tokio::test]
async fn multipart_completion_checks_parts() {
    let h = harness(sync_config());
    h.coordinator.init("b1", BatchSession::default()).await.unwrap();
    let mut file = text_file("b1", "/big.md");
    file.upload = UploadKind::Multipart {
        upload_id: "up-1".into(),
        part_count: 2,
    };
    let key = file.r2_key.clone();
    h.coordinator.add_file("b1", file).await.unwrap();

    let partial = vec![CompletedPart {
        part_number: 1,
        etag: "e1".into(),
    }];
    assert!(matches!(
        h.coordinator.complete_file("b1", &key, partial).await,
        Err(CoordinatorError::InvalidParts(_))
    ));

    let parts = vec![
        CompletedPart {
            part_number: 2,
            etag: "e2".into(),
        },
        CompletedPart {
            part_number: 1,
            etag: "e1".into(),
        },
    ];
    let done = h.coordinator.complete_file("b1", &key, parts).await.unwrap();
    assert_eq!(done.status, FileStatus::Completed);
    assert_eq!(done.parts.len(), 2);
}

#[tokio::test]
async fn small_batch_finalizes_inline() {
    let h = harness(sync_config());
    let record = uploaded_batch(&h, "b-sync", &["/docs/a.md", "/docs/sub/b.md", "/c.md"]).await;

    let outcome = h
        .coordinator
        .finalize("b-sync", record.manifest())
        .await
        .unwrap();
    assert_eq!(outcome.mode, DiscoveryMode::Sync);
    assert_eq!(outcome.summary.status, BatchStatus::Preprocessing);

    // no further uploads once discovery has run
    let late = h.coordinator.add_file("b-sync", text_file("b-sync", "/late.md")).await;
    assert!(matches!(late, Err(CoordinatorError::InvalidStatus { .. })));

    let jobs = h.queue.jobs();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.batch_id, "b-sync");
    assert_eq!(job.total_files, 3);
    assert_eq!(job.directories, 3);
    assert_eq!(job.manifest_key, manifest_key("b-sync"));

    let root_pi = job.discovery.root_pi.clone().unwrap();
    let root = h.entities.entity(&root_pi).unwrap();
    assert_eq!(root.children_pi.len(), 1);

    let manifest = h.state.get_manifest(&job.manifest_key).await.unwrap().unwrap();
    assert_eq!(manifest.total_files, 3);
}

#[tokio::test]
async fn large_batch_finishes_through_scheduled_steps() {
    let h = harness(async_config());
    let record = uploaded_batch(&h, "b-async", &["/x/1.md", "/x/2.md", "/y/3.md"]).await;

    let outcome = h
        .coordinator
        .finalize("b-async", record.manifest())
        .await
        .unwrap();
    assert_eq!(outcome.mode, DiscoveryMode::Async);
    assert_eq!(outcome.summary.status, BatchStatus::Discovery);

    let done = wait_for_status(&h, "b-async", BatchStatus::Preprocessing).await;
    let state = done.discovery.unwrap();
    let jobs = h.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].discovery.root_pi.as_deref(), state.root_pi());
    assert_eq!(state.counters.files_uploaded, 3);
}

#[tokio::test]
async fn repeated_finalize_does_not_restart_discovery() {
    let h = harness(async_config());
    let record = uploaded_batch(&h, "b-twice", &["/a.md"]).await;
    h.coordinator
        .finalize("b-twice", record.manifest())
        .await
        .unwrap();
    let again = h.coordinator.finalize("b-twice", record.manifest()).await;

    // either still in flight or already handed off, never a second tree
    if let Err(err) = again {
        assert!(matches!(err, CoordinatorError::InvalidStatus { .. }));
    }
    wait_for_status(&h, "b-twice", BatchStatus::Preprocessing).await;
    assert_eq!(h.queue.jobs().len(), 1);
}

#[tokio::test]
async fn exhausted_step_retries_fail_the_batch() {
    let h = harness(async_config());
    let record = uploaded_batch(&h, "b-fail", &["/a/x.md"]).await;
    h.entities.fail_next_creates(100);

    h.coordinator
        .start_discovery("b-fail", record.manifest())
        .await
        .unwrap();

    let failed = wait_for_status(&h, "b-fail", BatchStatus::Failed).await;
    assert!(failed.error.is_some());
    assert_eq!(failed.discovery.unwrap().retry_count, 3);
    assert!(h.queue.jobs().is_empty());
}

#[tokio::test]
async fn pending_discovery_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state: Arc<dyn StateStore> = Arc::new(FsStateStore::new(dir.path()));

    // a record left mid-discovery by a previous process
    let h = harness_with(async_config(), state.clone());
    let mut record = BatchRecord::new("b-resume", BatchSession::default());
    for path in ["/r/a.md", "/r/s/b.md"] {
        let mut file = TrackedFile::from(text_file("b-resume", path));
        file.status = FileStatus::Completed;
        h.blobs
            .insert(file.r2_key.clone(), format!("body of {path}").into_bytes());
        record.files.push(file);
    }
    let manifest = record.manifest();
    let key = manifest_key("b-resume");
    state.put_manifest(&key, &manifest).await.unwrap();
    record.status = BatchStatus::Discovery;
    record.manifest_key = Some(key);
    record.total_files = manifest.total_files;
    record.discovery = Some(build(&manifest, &discovery_config()));
    state.save(&record).await.unwrap();

    // an idle batch is left alone
    state
        .save(&BatchRecord::new("b-idle", BatchSession::default()))
        .await
        .unwrap();

    let resumed = h.coordinator.resume_pending().await.unwrap();
    assert_eq!(resumed, vec!["b-resume".to_string()]);

    let done = wait_for_status(&h, "b-resume", BatchStatus::Preprocessing).await;
    assert!(done.discovery.unwrap().is_finished());

    let on_disk = state.load("b-resume").await.unwrap().unwrap();
    assert_eq!(on_disk.status, BatchStatus::Preprocessing);
    assert_eq!(h.queue.jobs().len(), 1);
}

#[tokio::test]
async fn discard_removes_record_and_manifest() {
    let h = harness(sync_config());
    let record = uploaded_batch(&h, "b-gone", &["/a.md"]).await;
    h.coordinator
        .finalize("b-gone", record.manifest())
        .await
        .unwrap();

    h.coordinator.discard("b-gone").await.unwrap();
    assert!(h.state.load("b-gone").await.unwrap().is_none());
    assert!(h
        .state
        .get_manifest(&manifest_key("b-gone"))
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        h.coordinator.get_state("b-gone").await,
        Err(CoordinatorError::BatchNotFound(_))
    ));
    assert!(h.coordinator.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_can_be_set_by_downstream_stages() {
    let h = harness(sync_config());
    uploaded_batch(&h, "b1", &["/a.md"]).await;
    let summary = h
        .coordinator
        .update_status("b1", BatchStatus::Failed, Some("preprocess crashed".into()))
        .await
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Failed);
    assert_eq!(summary.error.as_deref(), Some("preprocess crashed"));
}

#[tokio::test]
async fn failed_inline_hand_off_is_retried() {
    let h = harness(sync_config());
    let record = uploaded_batch(&h, "b-flaky", &["/a.md"]).await;
    h.queue.fail_next(1);

    let outcome = h.coordinator.finalize("b-flaky", record.manifest()).await;
    assert!(matches!(outcome, Err(CoordinatorError::Queue(_))));

    let done = wait_for_status(&h, "b-flaky", BatchStatus::Preprocessing).await;
    let state = done.discovery.unwrap();
    assert_eq!(state.phase, Phase::Done);
    assert_eq!(h.queue.jobs().len(), 1);
}

#[tokio::test]
async fn unknown_batches_get_no_actor() {
    let h = harness(sync_config());
    for id in ["ghost-1", "ghost-2", "ghost-3"] {
        assert!(matches!(
            h.coordinator.get_state(id).await,
            Err(CoordinatorError::BatchNotFound(_))
        ));
        assert!(matches!(
            h.coordinator
                .add_file(id, text_file(id, "/a.md"))
                .await,
            Err(CoordinatorError::BatchNotFound(_))
        ));
    }
    assert_eq!(h.coordinator.active_batches().await, 0);

    h.coordinator.init("b1", BatchSession::default()).await.unwrap();
    assert_eq!(h.coordinator.active_batches().await, 1);
}

#[tokio::test]
async fn idle_actors_retire_and_reload() {
    let h = harness(CoordinatorConfig {
        idle_timeout_ms: 20,
        ..sync_config()
    });
    let record = uploaded_batch(&h, "b-idle", &["/a.md", "/b/c.md"]).await;
    h.coordinator
        .finalize("b-idle", record.manifest())
        .await
        .unwrap();
    uploaded_batch(&h, "b-open", &["/x.md"]).await;

    for _ in 0..200 {
        if h.coordinator.active_batches().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.coordinator.active_batches().await, 0);

    // a fresh actor picks up the stored record
    let reloaded = h.coordinator.get_state("b-idle").await.unwrap();
    assert_eq!(reloaded.status, BatchStatus::Preprocessing);
    let open = h
        .coordinator
        .add_file("b-open", text_file("b-open", "/y.md"))
        .await
        .unwrap();
    assert_eq!(open.status, FileStatus::Pending);
    assert_eq!(h.coordinator.get_state("b-open").await.unwrap().files.len(), 2);
}

#[tokio::test]
async fn replace_files_swaps_the_list_after_discovery() {
    let h = harness(sync_config());
    let record = uploaded_batch(&h, "b-swap", &["/a.md", "/b.md", "/c.md"]).await;
    h.coordinator
        .finalize("b-swap", record.manifest())
        .await
        .unwrap();

    let mut kept = TrackedFile::from(text_file("b-swap", "/merged.md"));
    kept.status = FileStatus::Completed;
    let pending = TrackedFile::from(text_file("b-swap", "/pending.md"));
    let summary = h
        .coordinator
        .replace_files("b-swap", vec![kept.clone(), pending.clone()])
        .await
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Preprocessing);
    assert_eq!(summary.files, 2);
    assert_eq!(summary.files_completed, 1);

    let current = h.coordinator.get_state("b-swap").await.unwrap();
    assert_eq!(current.files, vec![kept.clone(), pending.clone()]);
    let persisted = h.state.load("b-swap").await.unwrap().unwrap();
    assert_eq!(persisted.files, vec![kept, pending]);
}

#[tokio::test]
async fn reannouncing_a_completed_file_keeps_it_completed() {
    let h = harness(sync_config());
    h.coordinator.init("b1", BatchSession::default()).await.unwrap();
    let mut file = text_file("b1", "/big.md");
    file.upload = UploadKind::Multipart {
        upload_id: "up-1".into(),
        part_count: 1,
    };
    let key = file.r2_key.clone();
    h.coordinator.add_file("b1", file.clone()).await.unwrap();
    let parts = vec![CompletedPart {
        part_number: 1,
        etag: "e1".into(),
    }];
    h.coordinator
        .complete_file("b1", &key, parts.clone())
        .await
        .unwrap();

    let again = h.coordinator.add_file("b1", file).await.unwrap();
    assert_eq!(again.status, FileStatus::Completed);
    assert_eq!(again.parts, parts);

    let record = h.coordinator.get_state("b1").await.unwrap();
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.manifest().total_files, 1);
}
