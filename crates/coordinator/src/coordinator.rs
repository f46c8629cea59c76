use crate::actor::{self, ActorContext, BatchCommand, FinalizeOutcome};
use crate::batch::{
    validate_batch_id, BatchRecord, BatchSession, BatchStatus, BatchSummary, CompletedPart,
    NewFile, TrackedFile,
};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::persist::StateStore;
use crate::queue::JobQueue;
use ingest_discovery::{DiscoveryConfig, DiscoveryProcessor};
use ingest_protocol::Manifest;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Live actor mailboxes by batch id.
///
/// Senders are only cloned while the registry is locked, so an actor that
/// holds the lock can tell whether anyone else may still reach it.
#[derive(Default)]
pub(crate) struct Registry {
    actors: HashMap<String, mpsc::Sender<BatchCommand>>,
    /// Bumped whenever an entry is removed
    evictions: u64,
}

impl Registry {
    fn live(&self, batch_id: &str) -> Option<mpsc::Sender<BatchCommand>> {
        self.actors
            .get(batch_id)
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    fn remove(&mut self, batch_id: &str) {
        self.actors.remove(batch_id);
        self.evictions += 1;
    }

    /// Drop the entry of an idle actor. Fails while a caller still holds a
    /// clone of its sender.
    pub(crate) fn retire(&mut self, batch_id: &str) -> bool {
        if self
            .actors
            .get(batch_id)
            .is_some_and(|tx| tx.strong_count() > 1)
        {
            return false;
        }
        self.remove(batch_id);
        true
    }
}

/// Entry point for every batch mutation.
///
/// Each batch id is owned by one actor task; calls for the same batch are
/// queued on its mailbox and applied in arrival order, calls for different
/// batches run independently. Actors exist only for batches with a record
/// and retire once idle.
pub struct BatchCoordinator {
    ctx: Arc<ActorContext>,
    registry: Arc<Mutex<Registry>>,
}

impl BatchCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        discovery: DiscoveryConfig,
        processor: Arc<DiscoveryProcessor>,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self> {
        config.validate().map_err(CoordinatorError::InvalidConfig)?;
        discovery.validate()?;
        Ok(Self {
            ctx: Arc::new(ActorContext {
                config,
                discovery,
                processor,
                store,
                queue,
            }),
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.ctx.config
    }

    /// Number of batches with a running actor.
    pub async fn active_batches(&self) -> usize {
        self.registry
            .lock()
            .await
            .actors
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Mailbox of the actor owning `batch_id`, starting one if needed. Without
    /// `create`, a batch with no record is `BatchNotFound` and gets no actor.
    async fn mailbox(&self, batch_id: &str, create: bool) -> Result<mpsc::Sender<BatchCommand>> {
        validate_batch_id(batch_id)?;
        loop {
            let seen = {
                let registry = self.registry.lock().await;
                if let Some(tx) = registry.live(batch_id) {
                    return Ok(tx);
                }
                registry.evictions
            };

            // loaded unlocked so other batches are not held up behind the store
            let record = self.ctx.store.load(batch_id).await?;

            let mut registry = self.registry.lock().await;
            if let Some(tx) = registry.live(batch_id) {
                return Ok(tx);
            }
            if registry.evictions != seen {
                // an actor retired or a batch was discarded meanwhile; the
                // record may be stale
                continue;
            }
            if record.is_none() && !create {
                return Err(CoordinatorError::BatchNotFound(batch_id.to_string()));
            }
            let tx = actor::spawn(
                batch_id.to_string(),
                record,
                self.ctx.clone(),
                Arc::downgrade(&self.registry),
            );
            registry.actors.insert(batch_id.to_string(), tx.clone());
            return Ok(tx);
        }
    }

    async fn request<T>(
        &self,
        batch_id: &str,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> BatchCommand,
    ) -> Result<T> {
        self.request_with(batch_id, false, command).await
    }

    async fn request_with<T>(
        &self,
        batch_id: &str,
        create: bool,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> BatchCommand,
    ) -> Result<T> {
        let tx = self.mailbox(batch_id, create).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(command(reply_tx))
            .await
            .map_err(|_| CoordinatorError::ActorStopped(batch_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| CoordinatorError::ActorStopped(batch_id.to_string()))?
    }

    pub async fn init(&self, batch_id: &str, session: BatchSession) -> Result<BatchRecord> {
        self.request_with(batch_id, true, |reply| BatchCommand::Init { session, reply })
            .await
    }

    pub async fn get_state(&self, batch_id: &str) -> Result<BatchRecord> {
        self.request(batch_id, |reply| BatchCommand::GetState { reply })
            .await
    }

    /// Register a file; only while the batch is `uploading`.
    pub async fn add_file(&self, batch_id: &str, file: NewFile) -> Result<TrackedFile> {
        self.request(batch_id, |reply| BatchCommand::AddFile { file, reply })
            .await
    }

    /// Mark a file's bytes as fully uploaded. Completing a file twice is a no-op.
    pub async fn complete_file(
        &self,
        batch_id: &str,
        r2_key: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<TrackedFile> {
        let r2_key = r2_key.to_string();
        self.request(batch_id, |reply| BatchCommand::CompleteFile {
            r2_key,
            parts,
            reply,
        })
        .await
    }

    pub async fn replace_files(
        &self,
        batch_id: &str,
        files: Vec<TrackedFile>,
    ) -> Result<BatchSummary> {
        self.request(batch_id, |reply| BatchCommand::ReplaceFiles { files, reply })
            .await
    }

    pub async fn update_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<String>,
    ) -> Result<BatchSummary> {
        self.request(batch_id, |reply| BatchCommand::UpdateStatus {
            status,
            error,
            reply,
        })
        .await
    }

    /// Build the tree for `manifest` and hand it to scheduled steps.
    pub async fn start_discovery(&self, batch_id: &str, manifest: Manifest) -> Result<BatchSummary> {
        self.request(batch_id, |reply| BatchCommand::StartDiscovery { manifest, reply })
            .await
    }

    /// Persist the manifest and run discovery, inline for small batches.
    pub async fn finalize(&self, batch_id: &str, manifest: Manifest) -> Result<FinalizeOutcome> {
        self.request(batch_id, |reply| BatchCommand::Finalize { manifest, reply })
            .await
    }

    /// Drop a batch: stop its actor and delete its record and manifest.
    pub async fn discard(&self, batch_id: &str) -> Result<()> {
        let outcome = self
            .request(batch_id, |reply| BatchCommand::Discard { reply })
            .await;
        self.registry.lock().await.remove(batch_id);
        outcome
    }

    /// Reschedule every persisted batch that stopped mid-discovery. Returns
    /// the ids that were picked up.
    pub async fn resume_pending(&self) -> Result<Vec<String>> {
        let mut resumed = Vec::new();
        for record in self.ctx.store.list().await? {
            if !record.discovery_pending() {
                continue;
            }
            let tx = match self.mailbox(&record.batch_id, false).await {
                Ok(tx) => tx,
                // discarded since the listing
                Err(CoordinatorError::BatchNotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(BatchCommand::Resume { reply: reply_tx }).await.is_err() {
                continue;
            }
            if reply_rx.await.unwrap_or(false) {
                log::info!("resuming discovery for batch {}", record.batch_id);
                resumed.push(record.batch_id);
            }
        }
        Ok(resumed)
    }

    pub async fn list(&self) -> Result<Vec<BatchSummary>> {
        Ok(self
            .ctx
            .store
            .list()
            .await?
            .iter()
            .map(BatchRecord::summary)
            .collect())
    }
}
