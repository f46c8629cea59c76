use serde::{Deserialize, Serialize};

/// A sub-range of a text file, cut at a natural boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    /// Positional id (`chunk_0`, `chunk_1`, ...) assigned in document order
    pub id: String,

    /// The chunk text, including any overlap carried from the previous chunk
    pub text: String,

    /// Start offset in characters (inclusive)
    pub char_start: usize,

    /// End offset in characters (exclusive)
    pub char_end: usize,
}

impl TextChunk {
    /// Positional id for the chunk at `ordinal`
    #[must_use]
    pub fn id_for(ordinal: usize) -> String {
        format!("chunk_{ordinal}")
    }

    /// Number of characters covered by this chunk
    #[must_use]
    pub const fn char_len(&self) -> usize {
        self.char_end.saturating_sub(self.char_start)
    }

    /// Check if chunk covers a specific character offset
    #[must_use]
    pub const fn contains_char(&self, offset: usize) -> bool {
        offset >= self.char_start && offset < self.char_end
    }
}
