//! Text chunking module
//!
//! Deterministic recursive splitting for embedding. The splitter walks the
//! separator cascade `["\n\n", "\n", ". ", " ", ""]`, preferring paragraph
//! breaks over sentence breaks over words, and applies a character overlap
//! between neighboring chunks for context preservation.

use tracing::debug;

/// Separator cascade, most preferred first. The empty separator means a hard
/// character split.
pub const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// Configuration for text chunking
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target chunk size in bytes
    pub chunk_size: usize,
    /// Overlap between chunks in bytes
    pub chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
        }
    }
}

/// A produced chunk with its position in the document
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// Split text into chunks under the configured size, with overlap.
pub fn split_text(text: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let chunk_size = config.chunk_size.max(1);
    let base = recursive_split(trimmed, &SEPARATORS, chunk_size);

    let overlapped = apply_overlap(&base, config.chunk_overlap.min(chunk_size / 2));

    let total = overlapped.len();
    let chunks: Vec<TextChunk> = overlapped
        .into_iter()
        .enumerate()
        .map(|(i, text)| TextChunk {
            text,
            chunk_index: i,
            total_chunks: total,
        })
        .collect();

    debug!(
        input_len = trimmed.len(),
        chunk_count = chunks.len(),
        chunk_size,
        "Text chunked"
    );

    chunks
}

/// Recursive separator split with greedy merging.
fn recursive_split(text: &str, separators: &[&str], chunk_size: usize) -> Vec<String> {
    if text.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let Some((&sep, remaining)) = separators.split_first() else {
        return hard_split(text, chunk_size);
    };

    if sep.is_empty() {
        return hard_split(text, chunk_size);
    }

    if !text.contains(sep) {
        return recursive_split(text, remaining, chunk_size);
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in split_keeping_separator(text, sep) {
        if piece.len() > chunk_size {
            if !current.trim().is_empty() {
                chunks.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            chunks.extend(recursive_split(&piece, remaining, chunk_size));
        } else if current.len() + piece.len() > chunk_size {
            if !current.trim().is_empty() {
                chunks.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            current.push_str(&piece);
        } else {
            current.push_str(&piece);
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Split on a separator, keeping it attached to the preceding piece so that
/// rejoining chunks reproduces the original text.
fn split_keeping_separator(text: &str, sep: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;

    while let Some(pos) = rest.find(sep) {
        let end = pos + sep.len();
        pieces.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }

    pieces
}

/// Hard split at character boundaries.
fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if current.len() + ch.len_utf8() > chunk_size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Prefix each chunk after the first with the tail of its predecessor.
fn apply_overlap(chunks: &[String], overlap: usize) -> Vec<String> {
    if overlap == 0 || chunks.len() <= 1 {
        return chunks
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }

    let mut out = Vec::with_capacity(chunks.len());
    let mut prev_tail = String::new();

    for (i, chunk) in chunks.iter().enumerate() {
        let combined = if i == 0 {
            chunk.clone()
        } else {
            format!("{}{}", prev_tail, chunk)
        };
        prev_tail = tail(chunk, overlap);

        let trimmed = combined.trim().to_string();
        if !trimmed.is_empty() {
            out.push(trimmed);
        }
    }

    out
}

/// The last `max_bytes` of a string, cut at a character boundary.
fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_text("", &ChunkerConfig::default()).is_empty());
        assert!(split_text("   \n\n  ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = split_text("Just one sentence.", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Just one sentence.");
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 1);
    }

    #[test]
    fn splits_on_paragraphs_first() {
        let text = format!("{}\n\n{}", "a".repeat(80), "b".repeat(80));
        let config = ChunkerConfig {
            chunk_size: 100,
            chunk_overlap: 0,
        };
        let chunks = split_text(&text, &config);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.starts_with('a'));
        assert!(chunks[1].text.starts_with('b'));
    }

    #[test]
    fn falls_back_to_sentences() {
        let text = "First sentence is here. Second sentence is here. Third sentence is here.";
        let config = ChunkerConfig {
            chunk_size: 30,
            chunk_overlap: 0,
        };
        let chunks = split_text(text, &config);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 30, "chunk too long: {:?}", chunk.text);
        }
    }

    #[test]
    fn hard_splits_unbroken_text() {
        let text = "x".repeat(250);
        let config = ChunkerConfig {
            chunk_size: 100,
            chunk_overlap: 0,
        };
        let chunks = split_text(&text, &config);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text.len(), 100);
        assert_eq!(chunks[2].text.len(), 50);
    }

    #[test]
    fn overlap_carries_previous_tail() {
        let text = format!("{}\n\n{}", "a".repeat(80), "b".repeat(80));
        let config = ChunkerConfig {
            chunk_size: 100,
            chunk_overlap: 20,
        };
        let chunks = split_text(&text, &config);
        assert_eq!(chunks.len(), 2);
        // The second chunk starts with the tail of the first.
        assert!(chunks[1].text.starts_with("aaaa"));
        assert!(chunks[1].text.contains("bbbb"));
    }

    #[test]
    fn deterministic_on_fixed_input() {
        let text = "Refund policy. Our refund window is 14 days. Contact support for help.\n\nShipping takes 3 days.";
        let config = ChunkerConfig {
            chunk_size: 40,
            chunk_overlap: 10,
        };
        let a = split_text(text, &config);
        let b = split_text(text, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn indexes_and_totals_are_consistent() {
        let text = "word ".repeat(500);
        let chunks = split_text(&text, &ChunkerConfig::default());
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.total_chunks, total);
        }
    }

    #[test]
    fn multibyte_text_splits_at_char_boundaries() {
        let text = "é".repeat(300);
        let config = ChunkerConfig {
            chunk_size: 100,
            chunk_overlap: 10,
        };
        // Must not panic on a byte boundary inside a code point.
        let chunks = split_text(&text, &config);
        assert!(!chunks.is_empty());
    }
}
