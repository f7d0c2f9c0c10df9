//! Splitting long source text into bounded chunks.
//!
//! Chunks are contiguous slices of the input: concatenating them in order
//! reproduces the original text byte for byte. Sizes are measured in
//! characters, not bytes, so CJK prose is bounded the same way as ASCII.
//!
//! Cut points are chosen from the end of each window backwards, preferring
//! (in order) section separator lines, blank-line paragraph breaks, sentence
//! ends, any whitespace, and finally a hard cut.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ReelError, Result};

/// One contiguous segment of the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-based ordinal within the source text.
    pub id: usize,
    /// The segment itself.
    pub text: String,
    /// Opening characters of the next chunk, if overlap is enabled.
    pub lookahead: Option<String>,
}

impl Chunk {
    /// Creates a chunk without a lookahead.
    pub fn new(id: usize, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            lookahead: None,
        }
    }

    /// Length of the chunk in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Pre-analysis of a text, computed without splitting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkPlan {
    /// Characters in the whole text.
    pub total_chars: usize,
    /// Lower bound on the number of chunks `split` will produce.
    pub estimated_chunks: usize,
    /// Whether the text exceeds a single chunk.
    pub needs_chunking: bool,
}

fn section_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[-─*═=]{3,}[ \t]*\n").expect("valid regex"))
}

fn paragraph_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid regex"))
}

/// Sentence terminators. An ASCII `.` only counts when followed by
/// whitespace, so decimals like `3.14` are never cut.
fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:[。！？…!?]+["'”’」』)\]]*|\.+["'”’」』)\]]*\s)\s*"#)
            .expect("valid regex")
    })
}

/// Titles whose trailing period does not end a sentence.
const ABBREVIATIONS: &[&str] = &["Mr", "Mrs", "Ms", "Dr", "St", "Jr", "Sr", "Prof", "Mt"];

/// Returns true if the match starting at `start` is the period of an
/// abbreviation such as `Mr.`.
fn is_abbreviation(window: &str, start: usize, matched: &str) -> bool {
    if !matched.starts_with('.') {
        return false;
    }
    let before = &window[..start];
    let word_start = before
        .char_indices()
        .rev()
        .find(|(_, ch)| !ch.is_alphabetic())
        .map(|(i, ch)| i + ch.len_utf8())
        .unwrap_or(0);
    ABBREVIATIONS.contains(&&before[word_start..])
}

/// Analyses `text` against `max_chunk_size` without splitting it.
///
/// # Errors
///
/// Returns [`ReelError::Configuration`] if `max_chunk_size` is zero.
pub fn plan(text: &str, max_chunk_size: usize) -> Result<ChunkPlan> {
    check_size(max_chunk_size)?;
    let total_chars = text.chars().count();
    Ok(ChunkPlan {
        total_chars,
        estimated_chunks: total_chars.div_ceil(max_chunk_size).max(1),
        needs_chunking: total_chars > max_chunk_size,
    })
}

/// Splits `text` into chunks of at most `max_chunk_size` characters.
///
/// A text that fits in one chunk (including the empty text) yields exactly
/// one chunk.
///
/// # Errors
///
/// Returns [`ReelError::Configuration`] if `max_chunk_size` is zero.
pub fn split(text: &str, max_chunk_size: usize) -> Result<Vec<Chunk>> {
    split_with_overlap(text, max_chunk_size, 0)
}

/// Like [`split`], additionally attaching up to `overlap` characters of each
/// following chunk as that chunk's predecessor's lookahead.
///
/// # Errors
///
/// Returns [`ReelError::Configuration`] if `max_chunk_size` is zero.
pub fn split_with_overlap(text: &str, max_chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    check_size(max_chunk_size)?;

    let mut pieces = Vec::new();
    let mut rest = text;
    loop {
        let Some(limit) = byte_offset_of_char(rest, max_chunk_size) else {
            pieces.push(rest);
            break;
        };
        let cut = find_cut(&rest[..limit]);
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        if tail.is_empty() {
            break;
        }
        rest = tail;
    }

    let mut chunks: Vec<Chunk> = pieces
        .iter()
        .enumerate()
        .map(|(id, piece)| Chunk::new(id, *piece))
        .collect();

    if overlap > 0 {
        for i in 0..chunks.len().saturating_sub(1) {
            let preview: String = chunks[i + 1].text.chars().take(overlap).collect();
            chunks[i].lookahead = Some(preview);
        }
    }

    Ok(chunks)
}

fn check_size(max_chunk_size: usize) -> Result<()> {
    if max_chunk_size == 0 {
        return Err(ReelError::Configuration(
            "max_chunk_size must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Byte offset just past the first `n` characters, or `None` if the text
/// has at most `n` characters.
fn byte_offset_of_char(text: &str, n: usize) -> Option<usize> {
    let mut indices = text.char_indices().skip(n);
    indices.next().map(|(offset, _)| offset)
}

/// Picks a cut position inside a full window. Always returns a non-zero
/// offset on a char boundary, at most `window.len()`.
fn find_cut(window: &str) -> usize {
    for pattern in [section_break(), paragraph_break()] {
        if let Some(end) = pattern.find_iter(window).map(|m| m.end()).last() {
            return end;
        }
    }

    if let Some(end) = sentence_end()
        .find_iter(window)
        .filter(|m| !is_abbreviation(window, m.start(), m.as_str()))
        .map(|m| m.end())
        .last()
    {
        return end;
    }

    if let Some((offset, ch)) = window.char_indices().rev().find(|(_, ch)| ch.is_whitespace()) {
        let end = offset + ch.len_utf8();
        if end > 0 {
            return end;
        }
    }

    window.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rejoin(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = split("A short tale.", 2000).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, 0);
        assert_eq!(chunks[0].text, "A short tale.");
        assert!(chunks[0].lookahead.is_none());
    }

    #[test]
    fn test_empty_text_single_chunk() {
        let chunks = split("", 10).unwrap();
        assert_eq!(chunks, vec![Chunk::new(0, "")]);
    }

    #[test]
    fn test_zero_size_is_configuration_error() {
        assert!(matches!(split("abc", 0), Err(ReelError::Configuration(_))));
        assert!(matches!(plan("abc", 0), Err(ReelError::Configuration(_))));
    }

    #[test]
    fn test_five_thousand_chars_in_three_chunks() {
        let text = "x".repeat(5000);
        let chunks = split(&text, 2000).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(Chunk::char_len).collect::<Vec<_>>(),
            vec![2000, 2000, 1000]
        );
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = "First paragraph here.\n\nSecond paragraph that is longer.";
        let chunks = split(text, 30).unwrap();
        assert_eq!(chunks[0].text, "First paragraph here.\n\n");
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn test_prefers_section_break_over_paragraph() {
        let text = "Part one.\n\nStill one.\n---\nPart two.\n\nMore of two.";
        let chunks = split(text, 30).unwrap();
        assert_eq!(chunks[0].text, "Part one.\n\nStill one.\n---\n");
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn test_sentence_boundary_in_cjk_text() {
        let text = "少年拔剑。剑光如雪！他转身离去，再未回头";
        let chunks = split(text, 8).unwrap();
        assert_eq!(chunks[0].text, "少年拔剑。");
        assert!(chunks.iter().all(|c| c.char_len() <= 8));
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn test_decimal_point_is_not_a_sentence_end() {
        let text = "The bill came. It was 3.14 yuan in all and more";
        let chunks = split(text, 30).unwrap();
        assert_eq!(chunks[0].text, "The bill came. ");
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn test_title_abbreviation_is_not_a_sentence_end() {
        let text = "Tea was served. Then Mr. Chen arrived late";
        let chunks = split(text, 30).unwrap();
        assert_eq!(chunks[0].text, "Tea was served. ");
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn test_hard_cut_respects_char_boundaries() {
        let text = "龍".repeat(7);
        let chunks = split(&text, 3).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].text, "龍");
    }

    #[test]
    fn test_lookahead_from_next_chunk() {
        let text = "a".repeat(10);
        let chunks = split_with_overlap(&text, 4, 2).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].lookahead.as_deref(), Some("aa"));
        assert_eq!(chunks[1].lookahead.as_deref(), Some("aa"));
        assert!(chunks[2].lookahead.is_none());
        assert_eq!(rejoin(&chunks), text);
    }

    #[test]
    fn test_plan() {
        let plan = plan(&"y".repeat(4001), 2000).unwrap();
        assert_eq!(plan.total_chars, 4001);
        assert_eq!(plan.estimated_chunks, 3);
        assert!(plan.needs_chunking);
    }

    #[test]
    fn test_ids_are_sequential() {
        let chunks = split(&"word ".repeat(100), 37).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, i);
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip_and_bound(
            text in "[a-zMr。！？. \n─-]{0,400}",
            max in 1usize..64,
        ) {
            let chunks = split(&text, max).unwrap();
            prop_assert!(!chunks.is_empty());
            prop_assert_eq!(rejoin(&chunks), text);
            for chunk in &chunks {
                prop_assert!(chunk.char_len() <= max);
            }
            if chunks.len() > 1 {
                prop_assert!(chunks.iter().all(|c| !c.text.is_empty()));
            }
        }
    }
}
