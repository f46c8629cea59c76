//! # Ingest Text Chunker
//!
//! Splits large text files into overlapping, boundary-respecting chunks so each
//! piece can be uploaded and addressed on its own.
//!
//! ## Philosophy
//!
//! - Prefer the coarsest natural boundary that keeps a chunk under the size limit
//!   (paragraph, then line, sentence, clause, word, and finally single characters)
//! - Size chunks adaptively: long files get larger chunks, bounded on both sides
//! - Carry a short overlap tail between neighbours so context survives the cut
//! - Track every range against the original text, including across recursive splits
//!
//! ## Architecture
//!
//! ```text
//! Text
//!     │
//!     ├──> Threshold check (min_chunk_size)
//!     │
//!     ├──> Adaptive size: ceil(len / target_chunk_count), clamped
//!     │
//!     ├──> Recursive separator split
//!     │    ├─> Accumulate parts up to the size limit
//!     │    ├─> Seed next chunk with a word-aligned overlap tail
//!     │    └─> Recurse into oversized parts with a finer separator
//!     │
//!     └──> TextChunk[] (chunk_0, chunk_1, ...) with char ranges
//! ```
//!
//! ## Example
//!
//! ```rust
//! use ingest_text_chunker::{ChunkingConfig, TextChunker};
//!
//! let chunker = TextChunker::new(ChunkingConfig::default()).unwrap();
//!
//! let text = "A paragraph of notes.\n\n".repeat(200);
//! let chunks = chunker.plan(&text);
//! for chunk in &chunks {
//!     println!("{}: chars {}..{}", chunk.id, chunk.char_start, chunk.char_end);
//! }
//! assert_eq!(chunks.last().unwrap().char_end, text.chars().count());
//! ```

mod chunker;
mod config;
mod error;
mod separators;
mod types;

pub use chunker::{split_text, ChunkingStats, TextChunker};
pub use config::ChunkingConfig;
pub use error::{ChunkerError, Result};
pub use separators::Separator;
pub use types::TextChunk;
