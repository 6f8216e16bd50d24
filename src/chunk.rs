//! Overlapping, boundary-aware text chunker.
//!
//! Splits redacted document text into [`Chunk`]s of at most
//! `max_tokens * 4` bytes, carrying roughly `overlap_tokens * 4` bytes of
//! the previous chunk into the next. Cut points prefer, in order, a
//! paragraph break, a line break, a sentence end and a space; a hard cut is
//! the last resort. Overlap starts are moved forward to a word boundary.
//!
//! Chunk ids are `"{document_id}_chunk_{index}"`, so reprocessing the same
//! content yields the same ids, offsets and hashes.

use sha2::{Digest, Sha256};

use crate::models::{chunk_id, Chunk, ExtractedContent};

/// Approximate bytes per token.
const CHARS_PER_TOKEN: usize = 4;

const MASK_PREFIX: &str = "[REDACTED_";

/// Chunks extracted content and annotates each chunk with the page and the
/// section heading in effect at its start.
pub fn chunk_content(
    document_id: &str,
    content: &ExtractedContent,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let mut chunks = chunk_text(document_id, &content.text, max_tokens, overlap_tokens);
    for chunk in &mut chunks {
        chunk.page_number = content.page_at(chunk.start);
        chunk.section_title = content.section_at(chunk.start);
    }
    chunks
}

/// Splits `text` into chunks with contiguous indices starting at 0.
/// Whitespace-only text yields no chunks.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(CHARS_PER_TOKEN);
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars - 1);
    let len = text.len();

    let mut chunks = Vec::new();
    let mut start = skip_whitespace(text, 0);

    while start < len {
        let hard_end = floor_boundary(text, (start + max_chars).min(len));
        let end = if hard_end == len {
            len
        } else {
            best_break(text, start, hard_end, max_chars)
        };

        let piece = &text[start..end];
        let lead = piece.len() - piece.trim_start().len();
        let body = piece.trim();
        if !body.is_empty() {
            let chunk_start = start + lead;
            chunks.push(make_chunk(
                document_id,
                chunks.len(),
                body,
                chunk_start,
                chunk_start + body.len(),
            ));
        }

        if end >= len {
            break;
        }
        start = next_start(text, start, end, overlap_chars);
    }

    chunks
}

/// Largest char boundary `<= i`.
fn floor_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest char boundary `>= i`.
fn ceil_boundary(text: &str, mut i: usize) -> usize {
    while i < text.len() && !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    match text[from..].find(|c: char| !c.is_whitespace()) {
        Some(pos) => from + pos,
        None => text.len(),
    }
}

/// End offset for a chunk starting at `start` that may not pass `hard_end`.
/// Breaks in the first half of the window are ignored so chunks stay full.
fn best_break(text: &str, start: usize, hard_end: usize, max_chars: usize) -> usize {
    let window = &text[start..hard_end];
    let min = max_chars / 2;

    let after = |pattern: &'static str| {
        window
            .rfind(pattern)
            .map(|pos| pos + pattern.len())
            .filter(|&end| end > min)
    };

    if let Some(pos) = after("\n\n") {
        return start + pos;
    }
    if let Some(pos) = after("\n") {
        return start + pos;
    }
    let sentence = [". ", "? ", "! "]
        .iter()
        .filter_map(|p| after(*p))
        .max();
    if let Some(pos) = sentence {
        return start + pos;
    }
    if let Some(pos) = after(" ") {
        return start + pos;
    }
    hard_end
}

/// Start of the chunk following `start..end`: `overlap_chars` back from
/// `end`, moved forward to the next word start, always past `start`.
fn next_start(text: &str, start: usize, end: usize, overlap_chars: usize) -> usize {
    let mut next = ceil_boundary(text, end.saturating_sub(overlap_chars).max(start + 1));
    let mid_word = next < end
        && text[..next]
            .chars()
            .next_back()
            .is_some_and(|c| !c.is_whitespace());
    if mid_word {
        next = match text[next..end].find(char::is_whitespace) {
            Some(pos) => next + pos,
            None => end,
        };
    }
    skip_whitespace(text, next)
}

fn make_chunk(document_id: &str, index: usize, text: &str, start: usize, end: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index as i64,
        text: text.to_string(),
        hash,
        start,
        end,
        page_number: None,
        section_title: None,
        redaction_count: text.matches(MASK_PREFIX).count() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Heading, PageSpan};

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("doc1", "", 10, 2).is_empty());
        assert!(chunk_text("doc1", "  \n\n\t ", 10, 2).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc1", "  Hello, world!\n", 700, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "doc1_chunk_0");
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start, chunks[0].end), (2, 15));
    }

    #[test]
    fn chunks_respect_max_size_and_offsets() {
        let text = words(400);
        let chunks = chunk_text("doc1", &text, 20, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert!(c.text.len() <= 80, "chunk {} has {} bytes", i, c.text.len());
            assert_eq!(&text[c.start..c.end], c.text);
        }
    }

    #[test]
    fn every_word_is_covered() {
        let text = words(300);
        let chunks = chunk_text("doc1", &text, 16, 4);
        for w in text.split_whitespace() {
            assert!(
                chunks.iter().any(|c| c.text.split_whitespace().any(|x| x == w)),
                "{} missing",
                w
            );
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = words(200);
        let chunks = chunk_text("doc1", &text, 20, 5);
        for pair in chunks.windows(2) {
            assert!(pair[1].start < pair[0].end);
            assert!(pair[1].start > pair[0].start);
        }
    }

    #[test]
    fn zero_overlap_does_not_repeat() {
        let text = words(200);
        let chunks = chunk_text("doc1", &text, 20, 0);
        for pair in chunks.windows(2) {
            assert!(pair[1].start >= pair[0].end);
        }
    }

    #[test]
    fn paragraph_break_is_preferred() {
        let para_a = "a".repeat(30) + " " + &"b".repeat(20);
        let para_b = "c".repeat(40);
        let text = format!("{}\n\n{}", para_a, para_b);
        // max 80 bytes; both paragraphs together are 93.
        let chunks = chunk_text("doc1", &text, 20, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, para_a);
        assert_eq!(chunks[1].text, para_b);
    }

    #[test]
    fn sentence_break_beats_space() {
        let text = format!("{}. {} {}", "x".repeat(50), "y".repeat(10), "z".repeat(30));
        let chunks = chunk_text("doc1", &text, 20, 0);
        assert!(chunks[0].text.ends_with('.'));
    }

    #[test]
    fn unbroken_text_is_hard_cut() {
        let text = "q".repeat(200);
        let chunks = chunk_text("doc1", &text, 10, 2);
        assert!(chunks.iter().all(|c| c.text.len() <= 40));
        assert_eq!(chunks.last().map(|c| c.end), Some(200));
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let text = "é".repeat(100);
        let chunks = chunk_text("doc1", &text, 5, 1);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text.chars().all(|ch| ch == 'é'));
        }
    }

    #[test]
    fn deterministic() {
        let text = words(150);
        let a = chunk_text("doc1", &text, 12, 3);
        let b = chunk_text("doc1", &text, 12, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn content_chunks_carry_page_and_section() {
        let page1 = format!("# Intro\n\n{}\n\n", words(30));
        let page2 = format!("# Results\n\n{}", words(30));
        let text = format!("{}{}", page1, page2);
        let content = ExtractedContent {
            pages: vec![
                PageSpan { number: 1, start: 0, end: page1.len() },
                PageSpan { number: 2, start: page1.len(), end: text.len() },
            ],
            headings: vec![
                Heading { level: 1, title: "Intro".into(), offset: 0 },
                Heading { level: 1, title: "Results".into(), offset: page1.len() },
            ],
            text,
            ..Default::default()
        };
        let chunks = chunk_content("doc1", &content, 25, 5);
        assert_eq!(chunks[0].page_number, Some(1));
        assert_eq!(chunks[0].section_title.as_deref(), Some("Intro"));
        let last = chunks.last().unwrap();
        assert_eq!(last.page_number, Some(2));
        assert_eq!(last.section_title.as_deref(), Some("Results"));
    }

    #[test]
    fn redaction_tokens_are_counted() {
        let chunks = chunk_text(
            "doc1",
            "mail [REDACTED_EMAIL] or call [REDACTED_PHONE]",
            100,
            10,
        );
        assert_eq!(chunks[0].redaction_count, 2);
    }
}
