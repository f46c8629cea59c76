use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Store error: {0}")]
    StoreError(#[from] ingest_store::StoreError),

    #[error("Chunker error: {0}")]
    ChunkerError(#[from] ingest_text_chunker::ChunkerError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Publishing {path} failed: {source}")]
    PublishFailed {
        path: String,
        #[source]
        source: ingest_store::StoreError,
    },

    #[error("Discovery failed after {retries} attempts: {message}")]
    Failed { retries: u32, message: String },

    #[error("{0}")]
    Other(String),
}
