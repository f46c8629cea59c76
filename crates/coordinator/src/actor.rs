use crate::batch::{
    validate_parts, BatchRecord, BatchSession, BatchStatus, BatchSummary, CompletedPart,
    FileStatus, NewFile, TrackedFile, UploadKind,
};
use crate::config::CoordinatorConfig;
use crate::coordinator::Registry;
use crate::error::{CoordinatorError, Result};
use crate::persist::StateStore;
use crate::queue::JobQueue;
use ingest_discovery::{build, DiscoveryConfig, DiscoveryProcessor, Phase};
use ingest_protocol::{manifest_key, DiscoveryJob, Manifest};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

/// How `finalize` ran discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Ran to completion inside the call
    Sync,
    /// Handed to scheduled steps
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeOutcome {
    pub mode: DiscoveryMode,
    pub summary: BatchSummary,
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum BatchCommand {
    Init {
        session: BatchSession,
        reply: Reply<BatchRecord>,
    },
    GetState {
        reply: Reply<BatchRecord>,
    },
    AddFile {
        file: NewFile,
        reply: Reply<TrackedFile>,
    },
    CompleteFile {
        r2_key: String,
        parts: Vec<CompletedPart>,
        reply: Reply<TrackedFile>,
    },
    ReplaceFiles {
        files: Vec<TrackedFile>,
        reply: Reply<BatchSummary>,
    },
    UpdateStatus {
        status: BatchStatus,
        error: Option<String>,
        reply: Reply<BatchSummary>,
    },
    StartDiscovery {
        manifest: Manifest,
        reply: Reply<BatchSummary>,
    },
    Finalize {
        manifest: Manifest,
        reply: Reply<FinalizeOutcome>,
    },
    Resume {
        reply: oneshot::Sender<bool>,
    },
    Alarm,
    Discard {
        reply: Reply<()>,
    },
}

/// Collaborators shared by every batch actor.
pub(crate) struct ActorContext {
    pub config: CoordinatorConfig,
    pub discovery: DiscoveryConfig,
    pub processor: Arc<DiscoveryProcessor>,
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn JobQueue>,
}

struct BatchActor {
    batch_id: String,
    record: Option<BatchRecord>,
    ctx: Arc<ActorContext>,
    mailbox: mpsc::WeakSender<BatchCommand>,
    registry: Weak<Mutex<Registry>>,
    alarm_scheduled: bool,
}

enum Flow {
    Continue,
    Stop,
}

/// Start the actor owning `batch_id`. Commands are handled one at a time, so
/// no two mutations of the batch ever interleave.
///
/// The actor stops once it has been idle for `idle_timeout_ms` with no alarm
/// outstanding. Its record is then identical to the stored one.
pub(crate) fn spawn(
    batch_id: String,
    record: Option<BatchRecord>,
    ctx: Arc<ActorContext>,
    registry: Weak<Mutex<Registry>>,
) -> mpsc::Sender<BatchCommand> {
    let (tx, mut rx) = mpsc::channel(ctx.config.mailbox_capacity);
    let idle = Duration::from_millis(ctx.config.idle_timeout_ms);
    let mut actor = BatchActor {
        batch_id,
        record,
        ctx,
        mailbox: tx.downgrade(),
        registry,
        alarm_scheduled: false,
    };

    tokio::spawn(async move {
        loop {
            let next = tokio::time::timeout(idle, rx.recv()).await;
            match next {
                Ok(Some(command)) => {
                    if let Flow::Stop = actor.handle(command).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    if actor.try_retire(&rx).await {
                        break;
                    }
                }
            }
        }
        debug!("batch actor {} stopped", actor.batch_id);
    });
    tx
}

impl BatchActor {
    async fn handle(&mut self, command: BatchCommand) -> Flow {
        match command {
            BatchCommand::Init { session, reply } => {
                let _ = reply.send(self.init(session).await);
            }
            BatchCommand::GetState { reply } => {
                let _ = reply.send(self.current().cloned());
            }
            BatchCommand::AddFile { file, reply } => {
                let _ = reply.send(self.add_file(file).await);
            }
            BatchCommand::CompleteFile {
                r2_key,
                parts,
                reply,
            } => {
                let _ = reply.send(self.complete_file(&r2_key, parts).await);
            }
            BatchCommand::ReplaceFiles { files, reply } => {
                let _ = reply.send(self.replace_files(files).await);
            }
            BatchCommand::UpdateStatus {
                status,
                error,
                reply,
            } => {
                let _ = reply.send(self.update_status(status, error).await);
            }
            BatchCommand::StartDiscovery { manifest, reply } => {
                let _ = reply.send(self.start_discovery(manifest).await);
            }
            BatchCommand::Finalize { manifest, reply } => {
                let _ = reply.send(self.finalize(manifest).await);
            }
            BatchCommand::Resume { reply } => {
                let pending = self.record.as_ref().is_some_and(BatchRecord::discovery_pending);
                if pending {
                    self.schedule(Duration::ZERO);
                }
                let _ = reply.send(pending);
            }
            BatchCommand::Alarm => {
                self.alarm_scheduled = false;
                self.run_scheduled_step().await;
            }
            BatchCommand::Discard { reply } => {
                let _ = reply.send(self.discard().await);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Leave the registry if nothing can still reach this actor.
    async fn try_retire(&self, rx: &mpsc::Receiver<BatchCommand>) -> bool {
        if self.alarm_scheduled {
            return false;
        }
        let Some(registry) = self.registry.upgrade() else {
            return true;
        };
        let mut registry = registry.lock().await;
        if !rx.is_empty() || !registry.retire(&self.batch_id) {
            return false;
        }
        debug!("batch actor {} idle, retiring", self.batch_id);
        true
    }

    fn current(&self) -> Result<&BatchRecord> {
        self.record
            .as_ref()
            .ok_or_else(|| CoordinatorError::BatchNotFound(self.batch_id.clone()))
    }

    /// Persist `next` and make it the current record. On failure nothing changes.
    async fn commit(&mut self, mut next: BatchRecord) -> Result<&BatchRecord> {
        next.touch();
        self.ctx.store.save(&next).await?;
        Ok(self.record.insert(next))
    }

    async fn init(&mut self, session: BatchSession) -> Result<BatchRecord> {
        if self.record.is_some() {
            return Err(CoordinatorError::BatchExists(self.batch_id.clone()));
        }
        let record = BatchRecord::new(self.batch_id.clone(), session);
        info!("batch {} registered", self.batch_id);
        Ok(self.commit(record).await?.clone())
    }

    async fn add_file(&mut self, file: NewFile) -> Result<TrackedFile> {
        let current = self.current()?;
        current.expect_status(BatchStatus::Uploading)?;

        let mut next = current.clone();
        let mut tracked = TrackedFile::from(file);
        match next.file_mut(&tracked.r2_key) {
            // a client retrying the same announcement replaces its entry, but an
            // upload that already finished stays finished
            Some(existing) => {
                if existing.status == FileStatus::Completed {
                    tracked.status = FileStatus::Completed;
                    tracked.parts = std::mem::take(&mut existing.parts);
                }
                *existing = tracked.clone();
            }
            None => next.files.push(tracked.clone()),
        }
        self.commit(next).await?;
        Ok(tracked)
    }

    async fn complete_file(&mut self, r2_key: &str, parts: Vec<CompletedPart>) -> Result<TrackedFile> {
        let current = self.current()?;
        let file = current
            .files
            .iter()
            .find(|file| file.r2_key == r2_key)
            .ok_or_else(|| CoordinatorError::FileNotFound {
                batch_id: self.batch_id.clone(),
                r2_key: r2_key.to_string(),
            })?;
        if file.status == FileStatus::Completed {
            return Ok(file.clone());
        }
        current.expect_status(BatchStatus::Uploading)?;
        if let UploadKind::Multipart { part_count, .. } = &file.upload {
            validate_parts(*part_count, &parts)?;
        }

        let mut next = current.clone();
        let completed = match next.file_mut(r2_key) {
            Some(file) => {
                file.status = FileStatus::Completed;
                file.parts = parts;
                file.clone()
            }
            None => {
                return Err(CoordinatorError::FileNotFound {
                    batch_id: self.batch_id.clone(),
                    r2_key: r2_key.to_string(),
                })
            }
        };
        self.commit(next).await?;
        Ok(completed)
    }

    async fn replace_files(&mut self, files: Vec<TrackedFile>) -> Result<BatchSummary> {
        let mut next = self.current()?.clone();
        info!(
            "batch {}: replacing {} files with {}",
            self.batch_id,
            next.files.len(),
            files.len()
        );
        next.files = files;
        Ok(self.commit(next).await?.summary())
    }

    async fn update_status(&mut self, status: BatchStatus, error: Option<String>) -> Result<BatchSummary> {
        let mut next = self.current()?.clone();
        info!("batch {}: {} -> {status}", self.batch_id, next.status);
        next.status = status;
        if error.is_some() {
            next.error = error;
        }
        Ok(self.commit(next).await?.summary())
    }

    /// Persist the manifest, build the tree and move the batch to `discovery`.
    async fn prepare_discovery(&mut self, manifest: &Manifest) -> Result<BatchRecord> {
        let current = self.current()?;
        current.expect_status(BatchStatus::Uploading)?;

        let mut state = build(manifest, &self.ctx.discovery);
        state.parent_pi = current.session.parent_pi.clone();

        let key = manifest_key(&self.batch_id);
        self.ctx.store.put_manifest(&key, manifest).await?;

        let mut next = current.clone();
        next.status = BatchStatus::Discovery;
        next.manifest_key = Some(key);
        next.total_files = manifest.total_files;
        next.total_bytes = manifest.total_bytes;
        next.discovery = Some(state);
        next.error = None;
        Ok(self.commit(next).await?.clone())
    }

    async fn start_discovery(&mut self, manifest: Manifest) -> Result<BatchSummary> {
        if let Some(summary) = self
            .record
            .as_ref()
            .filter(|record| record.discovery_pending())
            .map(BatchRecord::summary)
        {
            self.schedule(Duration::ZERO);
            return Ok(summary);
        }
        let record = self.prepare_discovery(&manifest).await?;
        info!(
            "batch {}: discovery scheduled ({} files)",
            self.batch_id, record.total_files
        );
        self.schedule(Duration::ZERO);
        Ok(record.summary())
    }

    async fn finalize(&mut self, manifest: Manifest) -> Result<FinalizeOutcome> {
        let text_files = build(&manifest, &self.ctx.discovery).counters.files_total;
        let small = manifest.total_files <= self.ctx.config.sync_max_files
            && text_files <= self.ctx.config.sync_max_text_files;
        let in_flight = self.record.as_ref().is_some_and(BatchRecord::discovery_pending);
        if in_flight || !small {
            let summary = self.start_discovery(manifest).await?;
            return Ok(FinalizeOutcome {
                mode: DiscoveryMode::Async,
                summary,
            });
        }

        let mut next = self.prepare_discovery(&manifest).await?;
        info!(
            "batch {}: running discovery inline ({} files, {} text)",
            self.batch_id, manifest.total_files, text_files
        );
        let Some(state) = next.discovery.as_mut() else {
            return Err(CoordinatorError::BatchNotFound(self.batch_id.clone()));
        };
        let run = self
            .ctx
            .processor
            .run_to_completion(state, &self.ctx.discovery.sync_limits, &self.ctx.config.step_retry)
            .await;

        match run {
            Ok(_) => match self.finish_discovery(next).await {
                Ok(summary) => Ok(FinalizeOutcome {
                    mode: DiscoveryMode::Sync,
                    summary,
                }),
                Err(err) => {
                    if self.record.as_ref().is_some_and(BatchRecord::discovery_pending) {
                        let delay = self.retry_delay();
                        warn!("batch {}: hand-off failed, retrying in {delay:?}: {err}", self.batch_id);
                        self.schedule(delay);
                    }
                    Err(err)
                }
            },
            Err(err) => {
                error!("batch {}: inline discovery failed: {err}", self.batch_id);
                next.status = BatchStatus::Failed;
                next.error = Some(err.to_string());
                self.commit(next).await?;
                Err(err.into())
            }
        }
    }

    /// Forward the results downstream and advance the batch.
    async fn finish_discovery(&mut self, mut next: BatchRecord) -> Result<BatchSummary> {
        let Some(state) = next.discovery.as_ref() else {
            return Err(CoordinatorError::BatchNotFound(self.batch_id.clone()));
        };
        let job = DiscoveryJob {
            batch_id: self.batch_id.clone(),
            manifest_key: next
                .manifest_key
                .clone()
                .unwrap_or_else(|| manifest_key(&self.batch_id)),
            total_files: next.total_files,
            total_bytes: next.total_bytes,
            directories: state.counters.directories_total,
            parent_pi: next.session.parent_pi.clone(),
            discovery: state.results(),
        };
        let root_pi = job.discovery.root_pi.clone();

        if let Err(err) = self.ctx.queue.send(job).await {
            // keep the finished state; the caller schedules the retry
            if let Some(state) = next.discovery.as_mut() {
                if state.record_step_failure(err.to_string(), self.ctx.config.step_retry.max_attempts) {
                    next.status = BatchStatus::Failed;
                    next.error = Some(err.to_string());
                }
            }
            self.commit(next).await?;
            return Err(err);
        }

        next.status = BatchStatus::Preprocessing;
        next.error = None;
        let summary = self.commit(next).await?.summary();
        info!(
            "batch {}: discovery complete, root {}",
            self.batch_id,
            root_pi.as_deref().unwrap_or("<none>")
        );
        Ok(summary)
    }

    async fn run_scheduled_step(&mut self) {
        let Some(record) = self.record.as_ref().filter(|r| r.discovery_pending()) else {
            return;
        };
        let mut next = record.clone();
        let Some(state) = next.discovery.as_mut() else {
            return;
        };
        let retry = self.ctx.config.step_retry;

        match state.phase {
            Phase::Done => {
                if let Err(err) = self.finish_discovery(next).await {
                    let delay = self.retry_delay();
                    warn!("batch {}: hand-off failed, retrying in {delay:?}: {err}", self.batch_id);
                    if self.record.as_ref().is_some_and(BatchRecord::discovery_pending) {
                        self.schedule(delay);
                    }
                }
                return;
            }
            Phase::Error => {
                next.status = BatchStatus::Failed;
                next.error = state.error.clone();
                self.persist_or_retry(next).await;
                return;
            }
            _ => {}
        }

        let step = self
            .ctx
            .processor
            .step(state, &self.ctx.discovery.async_limits)
            .await;

        let delay = match step {
            Ok(report) => {
                state.record_step_success();
                debug!(
                    "batch {}: {} step handled {} items",
                    self.batch_id, report.phase, report.processed
                );
                Duration::from_millis(self.ctx.config.step_interval_ms)
            }
            Err(err) => {
                let attempt = state.retry_count;
                if state.record_step_failure(err.to_string(), retry.max_attempts) {
                    error!(
                        "batch {}: discovery failed after {} attempts: {err}",
                        self.batch_id, state.retry_count
                    );
                    next.status = BatchStatus::Failed;
                    next.error = Some(err.to_string());
                    self.persist_or_retry(next).await;
                    return;
                }
                let delay = retry.jittered_delay(attempt);
                warn!(
                    "batch {}: discovery step failed (attempt {}), retrying in {delay:?}: {err}",
                    self.batch_id,
                    attempt + 1
                );
                delay
            }
        };

        if self.persist_or_retry(next).await {
            self.schedule(delay);
        }
    }

    /// Returns `true` when the record was saved; otherwise a retry is scheduled.
    async fn persist_or_retry(&mut self, next: BatchRecord) -> bool {
        match self.commit(next).await {
            Ok(_) => true,
            Err(err) => {
                let delay = self.retry_delay();
                error!(
                    "batch {}: saving state failed, step will rerun in {delay:?}: {err}",
                    self.batch_id
                );
                self.schedule(delay);
                false
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let attempt = self
            .record
            .as_ref()
            .and_then(|r| r.discovery.as_ref())
            .map_or(0, |state| state.retry_count);
        self.ctx.config.step_retry.jittered_delay(attempt)
    }

    /// Queue an alarm for this batch after `delay`. At most one is outstanding.
    fn schedule(&mut self, delay: Duration) {
        if self.alarm_scheduled {
            return;
        }
        self.alarm_scheduled = true;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(BatchCommand::Alarm).await;
            }
        });
    }

    async fn discard(&mut self) -> Result<()> {
        let record = self.current()?.clone();
        if let Some(key) = &record.manifest_key {
            self.ctx.store.delete_manifest(key).await?;
        }
        self.ctx.store.delete(&self.batch_id).await?;
        self.record = None;
        info!("batch {} discarded", self.batch_id);
        Ok(())
    }
}
