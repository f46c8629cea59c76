use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::separators::Separator;
use crate::types::TextChunk;

/// Main chunker interface for planning text chunks
#[derive(Debug, Clone)]
pub struct TextChunker {
    config: ChunkingConfig,
}

impl TextChunker {
    /// Create a new chunker with a validated configuration
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Whether a text of `total_chars` characters is large enough to chunk
    #[must_use]
    pub const fn should_chunk(&self, total_chars: usize) -> bool {
        total_chars >= self.config.min_chunk_size
    }

    /// Adaptive chunk size: `ceil(total / target_chunk_count)` clamped to
    /// `[min_chunk_size, max_chunk_size]`.
    #[must_use]
    pub fn chunk_size(&self, total_chars: usize) -> usize {
        if total_chars <= self.config.min_chunk_size {
            return self.config.min_chunk_size;
        }
        total_chars
            .div_ceil(self.config.target_chunk_count)
            .clamp(self.config.min_chunk_size, self.config.max_chunk_size)
    }

    /// Plan chunks for a whole file using the adaptive size and default separators.
    ///
    /// Returns an empty list when the text is below the threshold or fits in a
    /// single chunk.
    #[must_use]
    pub fn plan(&self, text: &str) -> Vec<TextChunk> {
        let total_chars = text.chars().count();
        if !self.should_chunk(total_chars) {
            return Vec::new();
        }

        let size = self.chunk_size(total_chars);
        if total_chars <= size {
            return Vec::new();
        }

        let chunks = split_text(text, size, self.config.overlap, &Separator::DEFAULT_ORDER);
        log::debug!(
            "planned {} chunks for {} chars (chunk size {}, overlap {})",
            chunks.len(),
            total_chars,
            size,
            self.config.overlap
        );
        chunks
    }

    /// Get configuration
    #[must_use]
    pub const fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Get statistics about a chunk plan
    #[must_use]
    pub fn get_stats(chunks: &[TextChunk]) -> ChunkingStats {
        let overlap_chars = chunks
            .windows(2)
            .map(|pair| pair[0].char_end.saturating_sub(pair[1].char_start))
            .sum();
        let total_chars: usize = chunks.iter().map(TextChunk::char_len).sum();

        ChunkingStats {
            total_chunks: chunks.len(),
            total_chars,
            overlap_chars,
            avg_chars_per_chunk: if chunks.is_empty() {
                0
            } else {
                total_chars / chunks.len()
            },
            min_chars: chunks.iter().map(TextChunk::char_len).min().unwrap_or(0),
            max_chars: chunks.iter().map(TextChunk::char_len).max().unwrap_or(0),
        }
    }
}

/// Split `text` into chunks of at most `size` characters.
///
/// Parts are cut at the first separator in `separators` that occurs in the text;
/// oversized parts recurse with the next separator. When no separator is left, the
/// part is cut into consecutive `size`-character windows. Each chunk after the
/// first begins with up to `overlap` trailing characters of its predecessor,
/// unless that would push it past `size`.
#[must_use]
pub fn split_text(
    text: &str,
    size: usize,
    overlap: usize,
    separators: &[Separator],
) -> Vec<TextChunk> {
    if text.is_empty() || size == 0 {
        return Vec::new();
    }

    let source = CharIndexedText::new(text);
    let splitter = Splitter {
        source: &source,
        size,
        overlap,
        separators,
    };

    let mut spans = Vec::new();
    splitter.split_range(0, source.len(), None, 0, &mut spans);

    spans
        .into_iter()
        .enumerate()
        .map(|(ordinal, (start, end))| TextChunk {
            id: TextChunk::id_for(ordinal),
            text: source.slice(start, end).to_string(),
            char_start: start,
            char_end: end,
        })
        .collect()
}

/// Text with a char → byte offset table, so char ranges slice in O(1).
struct CharIndexedText<'a> {
    text: &'a str,
    offsets: Vec<usize>,
}

impl<'a> CharIndexedText<'a> {
    fn new(text: &'a str) -> Self {
        let mut offsets: Vec<usize> = text.char_indices().map(|(idx, _)| idx).collect();
        offsets.push(text.len());
        Self { text, offsets }
    }

    fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[self.offsets[start]..self.offsets[end]]
    }
}

struct Splitter<'s, 'a> {
    source: &'s CharIndexedText<'a>,
    size: usize,
    overlap: usize,
    separators: &'s [Separator],
}

impl Splitter<'_, '_> {
    /// Emit `(char_start, char_end)` spans covering `[start, end)` in order.
    ///
    /// `lead` is the start of the overlap tail of the span emitted just before
    /// `start`; the first span begins there when the result still fits.
    fn split_range(
        &self,
        start: usize,
        end: usize,
        lead: Option<usize>,
        level: usize,
        out: &mut Vec<(usize, usize)>,
    ) {
        if end - start <= self.size {
            if end > start {
                let from = lead.filter(|&from| end - from <= self.size).unwrap_or(start);
                out.push((from, end));
            }
            return;
        }

        let Some(separator) = self.separators.get(level).copied() else {
            let mut cursor = lead.unwrap_or(start);
            while cursor < end {
                let next = (cursor + self.size).min(end);
                out.push((cursor, next));
                cursor = next;
            }
            return;
        };

        let parts = separator.split_keep(self.source.slice(start, end));
        if parts.len() <= 1 {
            self.split_range(start, end, lead, level + 1, out);
            return;
        }

        // while it ends at `start`, the open span is only the lead and has not
        // been emitted
        let mut current: Option<(usize, usize)> = lead.map(|from| (from, start));
        let mut part_start = start;
        for part in parts {
            let part_len = part.chars().count();
            let part_end = part_start + part_len;

            if part_len > self.size {
                let next_lead = match current.take() {
                    Some((open_start, open_end)) if open_end == start => Some(open_start),
                    Some((open_start, open_end)) => {
                        out.push((open_start, open_end));
                        self.overlap_tail(open_start, open_end)
                    }
                    None => None,
                };
                self.split_range(part_start, part_end, next_lead, level + 1, out);
                current = out.pop();
            } else {
                current = Some(match current {
                    None => (part_start, part_end),
                    Some((open_start, open_end)) if open_end - open_start + part_len <= self.size => {
                        (open_start, part_end)
                    }
                    Some((_, open_end)) if open_end == start => (part_start, part_end),
                    Some((open_start, open_end)) => {
                        out.push((open_start, open_end));
                        self.seed_with_overlap(open_start, open_end, part_end)
                    }
                });
            }

            part_start = part_end;
        }

        if let Some(open) = current {
            out.push(open);
        }
    }

    /// Open a new chunk ending at `part_end`, prefixed with the overlap tail of the
    /// chunk `[closed_start, closed_end)`. The part itself starts at `closed_end`.
    fn seed_with_overlap(&self, closed_start: usize, closed_end: usize, part_end: usize) -> (usize, usize) {
        let without_overlap = (closed_end, part_end);
        let Some(tail_start) = self.overlap_tail(closed_start, closed_end) else {
            return without_overlap;
        };
        if part_end - tail_start > self.size {
            return without_overlap;
        }
        (tail_start, part_end)
    }

    /// Start of the overlap tail of `[start, end)`, if the chunk is longer than the overlap.
    fn overlap_tail(&self, start: usize, end: usize) -> Option<usize> {
        if self.overlap == 0 || self.overlap >= end - start {
            return None;
        }
        Some(self.overlap_start(end - self.overlap, end))
    }

    /// Move the overlap start past the first space in the first half of the window,
    /// so the tail does not begin mid-word.
    fn overlap_start(&self, window_start: usize, window_end: usize) -> usize {
        let half = (window_end - window_start) / 2;
        let head = self.source.slice(window_start, window_start + half);
        match head.chars().position(|ch| ch == ' ') {
            Some(idx) => window_start + idx + 1,
            None => window_start,
        }
    }
}

/// Statistics about a chunk plan
#[derive(Debug, Clone)]
pub struct ChunkingStats {
    pub total_chunks: usize,
    pub total_chars: usize,
    pub overlap_chars: usize,
    pub avg_chars_per_chunk: usize,
    pub min_chars: usize,
    pub max_chars: usize,
}

impl std::fmt::Display for ChunkingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} | Chars: {} | Overlap: {} | Avg: {} | Range: {}-{}",
            self.total_chunks,
            self.total_chars,
            self.overlap_chars,
            self.avg_chars_per_chunk,
            self.min_chars,
            self.max_chars
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_document(total_chars: usize) -> String {
        let mut text = String::new();
        let mut line = 0usize;
        while text.len() < total_chars {
            text.push_str(&format!(
                "Sentence number {line} describes a part of the archive, with a clause. "
            ));
            if line % 4 == 3 {
                text.push('\n');
            }
            if line % 12 == 11 {
                text.push('\n');
            }
            line += 1;
        }
        text.truncate(total_chars);
        text
    }

    fn assert_covering(chunks: &[TextChunk], text: &str) {
        let chars: Vec<char> = text.chars().collect();
        assert_eq!(chunks.first().map(|c| c.char_start), Some(0));
        assert_eq!(chunks.last().map(|c| c.char_end), Some(chars.len()));
        for pair in chunks.windows(2) {
            assert!(pair[1].char_start <= pair[0].char_end, "gap between chunks");
            assert!(pair[1].char_start > pair[0].char_start, "chunk did not advance");
        }
        for chunk in chunks {
            let expected: String = chars[chunk.char_start..chunk.char_end].iter().collect();
            assert_eq!(chunk.text, expected);
        }
    }

    #[test]
    fn test_below_threshold_is_not_chunked() {
        let chunker = TextChunker::new(ChunkingConfig::default()).unwrap();
        assert!(!chunker.should_chunk(999));
        assert!(chunker.should_chunk(1_000));
        assert!(chunker.plan(&"a".repeat(999)).is_empty());
    }

    #[test]
    fn test_single_chunk_text_is_not_split() {
        let chunker = TextChunker::new(ChunkingConfig::default()).unwrap();
        assert!(chunker.plan(&"word ".repeat(200)).is_empty());
    }

    #[test]
    fn test_adaptive_chunk_size() {
        let chunker = TextChunker::new(ChunkingConfig::default()).unwrap();
        assert_eq!(chunker.chunk_size(500), 1_000);
        assert_eq!(chunker.chunk_size(1_500), 1_000);
        assert_eq!(chunker.chunk_size(50_000), 1_000);
        assert_eq!(chunker.chunk_size(200_000), 4_000);
        assert_eq!(chunker.chunk_size(200_001), 4_001);
        assert_eq!(chunker.chunk_size(5_000_000), 10_000);
    }

    #[test]
    fn test_fifty_thousand_char_file() {
        let chunker = TextChunker::new(ChunkingConfig::default()).unwrap();
        let text = sample_document(50_000);
        assert_eq!(text.chars().count(), 50_000);

        let chunks = chunker.plan(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.char_len() <= 1_000, "{} too large", chunk.id);
            assert!(chunk.char_end <= 50_000);
        }
        assert_eq!(chunks.last().unwrap().char_end, 50_000);
        assert_covering(&chunks, &text);
    }

    #[test]
    fn test_ids_follow_document_order() {
        let chunker = TextChunker::new(ChunkingConfig::default()).unwrap();
        let chunks = chunker.plan(&sample_document(8_000));
        for (ordinal, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, format!("chunk_{ordinal}"));
        }
    }

    #[test]
    fn test_paragraph_boundaries_preferred() {
        let paragraph = format!("{}\n\n", "x".repeat(298));
        let text = paragraph.repeat(10);
        let chunks = split_text(&text, 1_000, 0, &Separator::DEFAULT_ORDER);

        assert_eq!(chunks.len(), 4);
        for chunk in &chunks[..3] {
            assert!(chunk.text.ends_with("\n\n"));
            assert_eq!(chunk.char_len(), 900);
        }
        assert_eq!(chunks[3].char_len(), 300);
    }

    #[test]
    fn test_overlap_tail_starts_on_word() {
        let text = "aaaa bbbb cccc dddd eeee ffff gggg";
        let chunks = split_text(text, 20, 8, &Separator::DEFAULT_ORDER);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "aaaa bbbb cccc dddd ");
        assert_eq!((chunks[0].char_start, chunks[0].char_end), (0, 20));
        assert_eq!(chunks[1].text, "dddd eeee ffff gggg");
        assert_eq!((chunks[1].char_start, chunks[1].char_end), (15, 34));
    }

    #[test]
    fn test_overlap_dropped_when_it_would_overflow() {
        // 12 + 8 fills the first chunk; the 16-char part cannot take the tail as well.
        let text = format!("aaaaaaaaaaa bbbbbbb {}", "c".repeat(16));
        let chunks = split_text(&text, 20, 6, &[Separator::Word]);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "aaaaaaaaaaa bbbbbbb ");
        assert_eq!(chunks[1].text, "c".repeat(16));
        assert_eq!(chunks[1].char_start, 20);
    }

    #[test]
    fn test_recursive_split_tracks_positions() {
        let long_paragraph = "word ".repeat(60);
        let text = format!("short intro\n\n{long_paragraph}\n\ntail");
        let chunks = split_text(&text, 100, 0, &Separator::DEFAULT_ORDER);

        let ranges: Vec<(usize, usize)> = chunks.iter().map(|c| (c.char_start, c.char_end)).collect();
        assert_eq!(
            ranges,
            vec![(0, 13), (13, 113), (113, 213), (213, 313), (313, 319)]
        );
        assert_covering(&chunks, &text);
    }

    #[test]
    fn test_overlap_carried_into_recursive_split() {
        let text = format!("short intro\n\n{}", "word ".repeat(60));
        let chunks = split_text(&text, 100, 10, &Separator::DEFAULT_ORDER);

        assert_eq!(chunks[0].text, "short intro\n\n");
        assert!(chunks[1].char_start < chunks[0].char_end, "no overlap after intro");
        assert!(chunks[1].text.starts_with("intro"));
        for pair in chunks.windows(2) {
            assert!(pair[1].char_start < pair[0].char_end);
        }
        for chunk in &chunks {
            assert!(chunk.char_len() <= 100);
        }
        assert_covering(&chunks, &text);
    }

    #[test]
    fn test_hard_windows_when_no_separator_left() {
        let text = "a".repeat(25);
        let chunks = split_text(&text, 10, 0, &[Separator::Word]);

        let ranges: Vec<(usize, usize)> = chunks.iter().map(|c| (c.char_start, c.char_end)).collect();
        assert_eq!(ranges, vec![(0, 10), (10, 20), (20, 25)]);
    }

    #[test]
    fn test_multibyte_offsets_are_in_chars() {
        let text = "ñandú ".repeat(40);
        let chunks = split_text(&text, 50, 10, &Separator::DEFAULT_ORDER);
        assert_covering(&chunks, &text);
        for chunk in &chunks {
            assert_eq!(chunk.text.chars().count(), chunk.char_len());
        }
    }

    #[test]
    fn test_chunking_stats() {
        let text = "aaaa bbbb cccc dddd eeee ffff gggg";
        let chunks = split_text(text, 20, 8, &Separator::DEFAULT_ORDER);
        let stats = TextChunker::get_stats(&chunks);

        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.overlap_chars, 5);
        assert_eq!(stats.max_chars, 20);
        assert_eq!(stats.min_chars, 19);
        assert!(stats.to_string().starts_with("Chunks: 2"));
    }

    #[test]
    fn test_empty_text() {
        assert!(split_text("", 10, 0, &Separator::DEFAULT_ORDER).is_empty());
    }
}
