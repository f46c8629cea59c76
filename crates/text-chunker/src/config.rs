use crate::error::{ChunkerError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for adaptive text chunking.
///
/// All sizes are measured in characters (Unicode scalar values), not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Files shorter than this are never chunked; also the lower bound of the
    /// adaptive chunk size
    pub min_chunk_size: usize,

    /// Upper bound of the adaptive chunk size (hard limit per chunk)
    pub max_chunk_size: usize,

    /// Desired number of chunks per file before clamping
    pub target_chunk_count: usize,

    /// Characters carried from the end of one chunk into the next
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 1_000,
            max_chunk_size: 10_000,
            target_chunk_count: 50,
            overlap: 200,
        }
    }
}

impl ChunkingConfig {
    /// Config without overlap, mostly useful for inspecting raw boundaries
    pub fn without_overlap() -> Self {
        Self {
            overlap: 0,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 {
            return Err(ChunkerError::invalid_config("min_chunk_size must be > 0"));
        }

        if self.min_chunk_size > self.max_chunk_size {
            return Err(ChunkerError::invalid_config(format!(
                "min_chunk_size ({}) cannot exceed max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            )));
        }

        if self.target_chunk_count == 0 {
            return Err(ChunkerError::invalid_config(
                "target_chunk_count must be > 0",
            ));
        }

        if self.overlap >= self.min_chunk_size {
            return Err(ChunkerError::invalid_config(format!(
                "overlap ({}) must be smaller than min_chunk_size ({})",
                self.overlap, self.min_chunk_size
            )));
        }

        Ok(())
    }
}
