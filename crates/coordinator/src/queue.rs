use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use ingest_protocol::DiscoveryJob;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Downstream stage fed once discovery completes. Delivery is at-least-once.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, job: DiscoveryJob) -> Result<()>;
}

/// Collects jobs in memory.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<DiscoveryJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<DiscoveryJob> {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn send(&self, job: DiscoveryJob) -> Result<()> {
        log::info!("queued downstream job for batch {}", job.batch_id);
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(job);
        Ok(())
    }
}

/// Forwards jobs into a channel, for a consumer running in the same process.
pub struct ChannelJobQueue {
    tx: mpsc::Sender<DiscoveryJob>,
}

impl ChannelJobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DiscoveryJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn send(&self, job: DiscoveryJob) -> Result<()> {
        let batch_id = job.batch_id.clone();
        self.tx
            .send(job)
            .await
            .map_err(|_| CoordinatorError::Queue(format!("consumer gone, job for {batch_id} dropped")))
    }
}
