//! Paragraph-boundary text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `max_chars` characters.
//! Splitting occurs on paragraph boundaries (`\n\n`); each new chunk opens
//! with the trailing words of the previous one so that facts straddling a
//! boundary stay retrievable from either side.
//!
//! Each chunk carries a SHA-256 hash of its text for staleness detection.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkMetadata};

/// Split text into paragraph-bounded pieces of at most `max_chars` characters.
///
/// Text already within the limit is returned unchanged as a single piece.
/// Otherwise paragraphs accumulate until the next one would overflow; the
/// accumulated piece is emitted and the next starts with the last
/// `overlap_words` words of it (only when it had more words than that).
/// Paragraphs longer than the limit are hard-split at a newline or space.
pub fn split_text(text: &str, max_chars: usize, overlap_words: usize) -> Vec<String> {
    if char_len(text) <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        for piece in hard_split(para, max_chars) {
            let would_be = if current.is_empty() {
                char_len(piece)
            } else {
                char_len(&current) + 2 + char_len(piece)
            };

            if would_be > max_chars && !current.is_empty() {
                let emitted = std::mem::take(&mut current);
                let budget = max_chars.saturating_sub(char_len(piece) + 2);
                current = tail_words(&emitted, overlap_words, budget);
                chunks.push(emitted);
            }

            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(piece);
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }

    chunks
}

/// Chunk a document's text and attach its title, url and metadata.
/// Returns chunks with contiguous `chunk_id`s starting at 0.
pub fn chunk_document(
    text: &str,
    title: &str,
    url: &str,
    metadata: &ChunkMetadata,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    split_text(text, config.max_chars, config.overlap_words)
        .into_iter()
        .enumerate()
        .map(|(i, piece)| Chunk {
            hash: hash_text(&piece),
            text: piece,
            title: title.to_string(),
            url: url.to_string(),
            chunk_id: i,
            metadata: metadata.clone(),
        })
        .collect()
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`th character, or the string length.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Breaks an over-long paragraph into pieces of at most `max_chars`.
fn hard_split(para: &str, max_chars: usize) -> Vec<&str> {
    if char_len(para) <= max_chars {
        return vec![para];
    }

    let mut pieces = Vec::new();
    let mut remaining = para;
    while !remaining.is_empty() {
        if char_len(remaining) <= max_chars {
            pieces.push(remaining);
            break;
        }
        let limit = byte_offset(remaining, max_chars);
        let split_at = remaining[..limit]
            .rfind('\n')
            .or_else(|| remaining[..limit].rfind(' '))
            .filter(|&pos| pos > 0)
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = remaining[split_at..].trim_start();
    }
    pieces
}

/// Last `n` words of `text`, joined by spaces and shortened from the front
/// until they fit in `budget` characters. Empty when `text` has `n` words
/// or fewer.
fn tail_words(text: &str, n: usize, budget: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if n == 0 || words.len() <= n {
        return String::new();
    }

    let mut tail = &words[words.len() - n..];
    loop {
        let joined = tail.join(" ");
        if char_len(&joined) <= budget {
            return joined;
        }
        if tail.len() <= 1 {
            return String::new();
        }
        tail = &tail[1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{}{}", prefix, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("Hello, world!", 800, 100);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_text_at_limit_is_unchanged() {
        let text = "a".repeat(800);
        let chunks = split_text(&text, 800, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn test_chunks_respect_size_bound() {
        let text = (0..60)
            .map(|i| format!("Paragraph {} {}", i, words("w", 15 + i % 20)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = split_text(&text, 800, 100);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 800, "chunk of {} chars", c.len());
            assert!(!c.is_empty());
        }
    }

    #[test]
    fn test_overlong_paragraph_is_hard_split() {
        let text = format!("intro\n\n{}", words("token", 600));
        let chunks = split_text(&text, 800, 100);
        assert!(chunks.len() > 3);
        for c in &chunks {
            assert!(c.chars().count() <= 800);
        }
    }

    #[test]
    fn test_unicode_does_not_split_inside_char() {
        let text = "é".repeat(2000);
        let chunks = split_text(&text, 800, 100);
        assert_eq!(chunks.iter().map(|c| c.chars().count()).sum::<usize>(), 2000);
    }

    #[test]
    fn test_next_chunk_starts_with_overlap() {
        let first = words("a", 120);
        let second = words("b", 10);
        let text = format!("{}\n\n{}", first, second);
        let chunks = split_text(&text, 500, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], first);
        // Last 100 words of the first chunk lead the second one.
        let overlap = first.split_whitespace().skip(20).collect::<Vec<_>>().join(" ");
        assert_eq!(chunks[1], format!("{}\n\n{}", overlap, second));
    }

    #[test]
    fn test_no_overlap_from_short_chunk() {
        let first = format!("{} {}", "x".repeat(700), "short words");
        let second = "y".repeat(200);
        let text = format!("{}\n\n{}", first, second);
        let chunks = split_text(&text, 800, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], second);
    }

    #[test]
    fn test_chunk_document_indices_and_hash() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {} {}", i, words("p", 20)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let meta = ChunkMetadata {
            source: "gitbook".to_string(),
            scraped_at: None,
            has_live_data: false,
        };
        let chunks = chunk_document(&text, "Doc", "https://d", &meta, &ChunkingConfig::default());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_id, i, "Index mismatch at position {}", i);
            assert_eq!(c.hash, hash_text(&c.text));
            assert_eq!(c.title, "Doc");
        }
    }

    #[test]
    fn test_deterministic() {
        let text = format!("{}\n\n{}\n\n{}", words("a", 90), words("b", 90), words("c", 90));
        let c1 = split_text(&text, 300, 20);
        let c2 = split_text(&text, 300, 20);
        assert_eq!(c1, c2);
    }
}
