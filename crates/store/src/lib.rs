//! Entity store and blob store access for the ingest pipeline
//!
//! ## Pieces
//!
//! ```text
//! EntityStore (trait) ── MemoryEntityStore   in-process, deterministic ids
//!        │           └── HttpEntityStore     JSON over HTTP (reqwest)
//!        ▼
//! EntityClient ── optimistic-concurrency retry (RetryPolicy, jittered backoff)
//!
//! BlobStore (trait) ── FsBlobStore / MemoryBlobStore
//! ```
//!
//! Mutations that carry an `expect_tip` go through [`EntityClient`], which
//! re-reads the tip before each attempt and backs off between attempts.

mod blob;
mod error;
mod http;
mod memory;
mod retry;
mod traits;

pub use blob::FsBlobStore;
pub use error::{Result, StoreError};
pub use http::HttpEntityStore;
pub use memory::{content_address, MemoryBlobStore, MemoryEntityStore};
pub use retry::{EntityClient, RetryPolicy};
pub use traits::{BlobStore, EntityStore};
