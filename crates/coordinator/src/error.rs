use crate::batch::BatchStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Batch already exists: {0}")]
    BatchExists(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid batch id: {0:?}")]
    InvalidBatchId(String),

    #[error("Batch {batch_id} is {actual}, expected {expected}")]
    InvalidStatus {
        batch_id: String,
        expected: BatchStatus,
        actual: BatchStatus,
    },

    #[error("File {r2_key} not found in batch {batch_id}")]
    FileNotFound { batch_id: String, r2_key: String },

    #[error("Invalid multipart parts: {0}")]
    InvalidParts(String),

    #[error("Persistence error: {0}")]
    Persist(String),

    #[error("Discovery error: {0}")]
    Discovery(#[from] ingest_discovery::DiscoveryError),

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("Batch actor for {0} stopped")]
    ActorStopped(String),
}

impl From<std::io::Error> for CoordinatorError {
    fn from(err: std::io::Error) -> Self {
        Self::Persist(err.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persist(err.to_string())
    }
}
