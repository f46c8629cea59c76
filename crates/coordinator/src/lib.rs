//! # Ingest Coordinator
//!
//! Durable, single-writer owner of each batch.
//!
//! ```text
//! caller ──> BatchCoordinator ──> mailbox ──> batch actor (one per id)
//!                                               │  BatchRecord
//!                                               │  ├─ files
//!                                               │  └─ DiscoveryState
//!                                               ├─> StateStore (after every mutation)
//!                                               ├─> alarm ──> one discovery step
//!                                               └─> JobQueue (once discovery is done)
//! ```
//!
//! A failed step is retried with exponential backoff; when the retry budget
//! is spent the batch becomes `failed` with the last error attached.

mod actor;
mod batch;
mod config;
mod coordinator;
mod error;
mod persist;
mod queue;

pub use actor::{DiscoveryMode, FinalizeOutcome};
pub use batch::{
    validate_batch_id, validate_parts, BatchRecord, BatchSession, BatchStatus, BatchSummary,
    CompletedPart, FileStatus, NewFile, TrackedFile, UploadKind,
};
pub use config::CoordinatorConfig;
pub use coordinator::BatchCoordinator;
pub use error::{CoordinatorError, Result};
pub use persist::{FsStateStore, MemoryStateStore, StateStore};
pub use queue::{ChannelJobQueue, JobQueue, MemoryJobQueue};
