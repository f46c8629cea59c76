//! # Ingest Discovery
//!
//! Turns a batch manifest into a published entity tree, one entity per
//! directory, bottom-up.
//!
//! ## Phases
//!
//! ```text
//! Manifest ──> tree::build ──> DiscoveryState
//!                                   │
//!   UPLOADING      text files -> content ids (+ chunk plans)
//!   CHUNKING       chunk texts -> content ids
//!   PUBLISHING     deepest directories first, once all children exist
//!   RELATIONSHIPS  parent_pi back-links on every child
//!   DONE           root_pi + id/tip/version maps
//! ```
//!
//! Each [`DiscoveryProcessor::step`] handles at most one phase's bounded batch
//! and leaves everything needed to continue in the state, so a run can be
//! persisted and resumed between any two steps.

mod config;
mod error;
mod processor;
mod state;
pub mod tree;

pub use config::{
    DiscoveryConfig, StepLimits, STEP_CHUNKS_ENV, STEP_DIRECTORIES_ENV, STEP_FILES_ENV,
};
pub use error::{DiscoveryError, Result};
pub use processor::{DiscoveryProcessor, StepReport};
pub use state::{
    Chunk, DirectoryNode, DiscoveryCounters, DiscoveryProgress, DiscoveryState, Phase, TextFile,
};
pub use tree::build;
