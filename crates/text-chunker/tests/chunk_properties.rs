use ingest_text_chunker::{split_text, ChunkingConfig, Separator, TextChunk, TextChunker};
use proptest::prelude::*;

/// Rebuild the source by taking each chunk's characters beyond the previous end.
fn reconstruct(chunks: &[TextChunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.char_start);
        out.extend(chunk.text.chars().skip(skip));
        covered = covered.max(chunk.char_end);
    }
    out
}

fn text_strategy() -> impl Strategy<Value = String> {
    let word = "[a-zñé]{1,12}";
    let glue = prop_oneof![
        4 => Just(" "),
        1 => Just(", "),
        1 => Just(". "),
        1 => Just("\n"),
        1 => Just("\n\n"),
    ];
    prop::collection::vec((word, glue), 0..600).prop_map(|pieces| {
        pieces
            .into_iter()
            .map(|(w, g)| format!("{w}{g}"))
            .collect::<String>()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn short_text_is_never_chunked(len in 0usize..1_000) {
        let chunker = TextChunker::new(ChunkingConfig::default()).unwrap();
        let text = "y".repeat(len);
        prop_assert!(chunker.plan(&text).is_empty());
    }

    #[test]
    fn chunks_reconstruct_the_source(text in text_strategy(), size in 40usize..400, overlap in 0usize..40) {
        let chunks = split_text(&text, size, overlap, &Separator::DEFAULT_ORDER);
        prop_assert_eq!(reconstruct(&chunks), text.clone());
        if let Some(last) = chunks.last() {
            prop_assert_eq!(last.char_end, text.chars().count());
        }
    }

    #[test]
    fn chunks_respect_the_size_limit(text in text_strategy(), size in 40usize..400, overlap in 0usize..40) {
        let chunks = split_text(&text, size, overlap, &Separator::DEFAULT_ORDER);
        for chunk in &chunks {
            prop_assert!(chunk.char_len() <= size);
            prop_assert_eq!(chunk.text.chars().count(), chunk.char_len());
        }
    }

    #[test]
    fn planned_chunks_stay_within_max(text in text_strategy()) {
        let config = ChunkingConfig {
            min_chunk_size: 200,
            max_chunk_size: 600,
            target_chunk_count: 5,
            overlap: 50,
        };
        let chunker = TextChunker::new(config).unwrap();
        for chunk in chunker.plan(&text) {
            prop_assert!(chunk.char_len() <= 600);
        }
    }
}
