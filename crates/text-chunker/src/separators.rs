use serde::{Deserialize, Serialize};

/// Boundary kinds, ordered from coarsest to finest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Separator {
    /// Blank line between paragraphs
    Paragraph,
    /// Single line break
    Line,
    /// End of a sentence followed by whitespace
    Sentence,
    /// Comma, semicolon or colon followed by a space
    Clause,
    /// Space between words
    Word,
    /// Any character boundary (last resort)
    Character,
}

impl Separator {
    /// Default priority, highest first
    pub const DEFAULT_ORDER: [Separator; 6] = [
        Self::Paragraph,
        Self::Line,
        Self::Sentence,
        Self::Clause,
        Self::Word,
        Self::Character,
    ];

    /// Literal patterns that end a part; empty for `Character`
    #[must_use]
    pub const fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::Paragraph => &["\n\n"],
            Self::Line => &["\n"],
            Self::Sentence => &[". ", "! ", "? ", ".\n", "!\n", "?\n"],
            Self::Clause => &[", ", "; ", ": "],
            Self::Word => &[" "],
            Self::Character => &[],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Line => "line",
            Self::Sentence => "sentence",
            Self::Clause => "clause",
            Self::Word => "word",
            Self::Character => "character",
        }
    }

    /// Split `text` into consecutive parts, each ending right after a separator
    /// match (the last part may end without one). Concatenating the parts yields
    /// `text` exactly.
    #[must_use]
    pub fn split_keep(self, text: &str) -> Vec<&str> {
        let patterns = self.patterns();
        if patterns.is_empty() {
            return text
                .char_indices()
                .map(|(idx, ch)| &text[idx..idx + ch.len_utf8()])
                .collect();
        }

        let mut parts = Vec::new();
        let mut part_start = 0;
        let mut cursor = 0;
        while cursor < text.len() {
            let rest = &text[cursor..];
            if let Some(pattern) = patterns.iter().find(|p| rest.starts_with(**p)) {
                cursor += pattern.len();
                parts.push(&text[part_start..cursor]);
                part_start = cursor;
                continue;
            }
            let step = rest.chars().next().map_or(1, char::len_utf8);
            cursor += step;
        }
        if part_start < text.len() {
            parts.push(&text[part_start..]);
        }
        parts
    }
}
