//! Recursive text splitter
//!
//! Cuts text on paragraph, line, sentence and word boundaries (in that order
//! of preference) and merges the pieces back into chunks of at most
//! `chunk_size` characters. Each chunk after the first starts with the last
//! `overlap` characters of its predecessor, except right after a hard split
//! of a separator-free block.
//!
//! All lengths are in characters, not bytes.

use crate::error::{MemoryError, Result};

/// Separator groups, highest priority first. Separators stay attached to the
/// piece they terminate so that pieces concatenate back to the input.
const SEPARATORS: &[&[&str]] = &[&["\n\n"], &["\n"], &[". ", "! ", "? "], &[" ", "\t"]];

/// Split `text` into overlapping chunks
pub fn split(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    Ok(TextSplitter::new(chunk_size, overlap)?.split(text))
}

/// Validated splitter settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSplitter {
    chunk_size: usize,
    overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(MemoryError::validation("chunk_size must be positive"));
        }
        if overlap >= chunk_size {
            return Err(MemoryError::validation(format!(
                "chunk overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split text into chunks. Blank text yields no chunks.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if char_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }

        // Pieces up to this size always fit behind a carried overlap.
        let budget = self.chunk_size - self.overlap;
        let mut pieces = Vec::new();
        split_recursive(text, 0, budget, &mut pieces);
        self.merge(&pieces, budget)
    }

    fn merge(&self, pieces: &[&str], budget: usize) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;
        // false while `current` holds nothing but carried overlap
        let mut fresh = false;

        for piece in pieces {
            let piece_len = char_len(piece);
            let fits = fresh && current_len + piece_len <= self.chunk_size;

            if piece_len > budget && !fits {
                if fresh {
                    chunks.push(std::mem::take(&mut current));
                }
                let windows = hard_split(piece, self.chunk_size);
                let carried = windows
                    .last()
                    .map(|w| tail_chars(w, self.overlap).to_string())
                    .unwrap_or_default();
                chunks.extend(windows.into_iter().map(str::to_string));
                current_len = char_len(&carried);
                current = carried;
                fresh = false;
                continue;
            }

            if fresh && current_len + piece_len > self.chunk_size {
                let carried = tail_chars(&current, self.overlap).to_string();
                current_len = char_len(&carried);
                chunks.push(std::mem::replace(&mut current, carried));
            }

            current.push_str(piece);
            current_len += piece_len;
            fresh = true;
        }

        if fresh {
            chunks.push(current);
        }

        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }
}

fn split_recursive<'a>(text: &'a str, level: usize, budget: usize, out: &mut Vec<&'a str>) {
    if level >= SEPARATORS.len() || char_len(text) <= budget {
        out.push(text);
        return;
    }

    for part in split_keeping(text, SEPARATORS[level]) {
        split_recursive(part, level + 1, budget, out);
    }
}

/// Split after every occurrence of any separator, keeping the separator
fn split_keeping<'a>(text: &'a str, separators: &[&str]) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let rest = &text[start..];
        let next = separators
            .iter()
            .filter_map(|sep| rest.find(sep).map(|pos| pos + sep.len()))
            .min();

        match next {
            Some(end) => {
                parts.push(&rest[..end]);
                start += end;
            }
            None => break,
        }
    }

    if start < text.len() {
        parts.push(&text[start..]);
    }
    parts
}

/// Cut at character boundaries into windows of `size` characters
fn hard_split(text: &str, size: usize) -> Vec<&str> {
    let mut windows = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == size {
            windows.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        windows.push(&text[start..]);
    }
    windows
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s`
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let len = char_len(s);
    if len <= n {
        return s;
    }
    match s.char_indices().nth(len - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prose(sentences: usize) -> String {
        let mut text = String::new();
        for i in 0..sentences {
            text.push_str(&format!(
                "Sentence {i} describes a project built with Rust and Postgres. "
            ));
            if i % 5 == 4 {
                text.push_str("\n\n");
            }
        }
        text
    }

    fn lengths(chunks: &[String]) -> Vec<usize> {
        chunks.iter().map(|c| c.chars().count()).collect()
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(split("", 1000, 200).unwrap().is_empty());
        assert!(split(" \n\n\t ", 1000, 200).unwrap().is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = split("Staff engineer at Acme.", 1000, 200).unwrap();
        assert_eq!(chunks, vec!["Staff engineer at Acme.".to_string()]);
    }

    #[test]
    fn test_short_text_with_long_word_single_chunk() {
        let text = format!("hello {}", "x".repeat(850));
        let chunks = split(&text, 1000, 200).unwrap();
        assert_eq!(chunks, vec![text]);
    }

    #[test]
    fn test_long_word_joins_preceding_piece_when_it_fits() {
        // 6 + 851 + 300 characters; the long word fits after "intro "
        let text = format!("intro {} {}", "x".repeat(850), "y ".repeat(150));
        let chunks = split(&text, 1000, 200).unwrap();

        assert!(chunks[0].starts_with("intro xxx"));
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1000);
        }
        let mut rebuilt = chunks[0].clone();
        for chunk in &chunks[1..] {
            rebuilt.extend(chunk.chars().skip(200));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_separator_free_block_hard_split() {
        let text = "A".repeat(2500);
        let chunks = split(&text, 1000, 200).unwrap();
        assert_eq!(lengths(&chunks), vec![1000, 1000, 500]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(split("x", 0, 0), Err(MemoryError::Validation(_))));
        assert!(matches!(
            split("x", 100, 100),
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            TextSplitter::new(100, 150),
            Err(MemoryError::Validation(_))
        ));
        assert!(TextSplitter::new(100, 0).is_ok());
    }

    #[test]
    fn test_deterministic() {
        let text = prose(80);
        let splitter = TextSplitter::new(240, 40).unwrap();
        let first = splitter.split(&text);
        for _ in 0..3 {
            assert_eq!(splitter.split(&text), first);
        }
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = prose(120);
        let chunks = split(&text, 200, 50).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 200, "oversized chunk: {chunk:?}");
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap_exactly() {
        let text = prose(120);
        let overlap = 50;
        let chunks = split(&text, 200, overlap).unwrap();

        for pair in chunks.windows(2) {
            let head = tail_chars(&pair[0], overlap);
            let next: String = pair[1].chars().take(overlap).collect();
            assert_eq!(head, next);
        }
    }

    #[test]
    fn test_reconstructs_original_text() {
        let text = prose(60);
        let overlap = 30;
        let chunks = split(&text, 150, overlap).unwrap();

        let mut rebuilt = chunks[0].clone();
        for chunk in &chunks[1..] {
            rebuilt.extend(chunk.chars().skip(overlap));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_zero_overlap_concatenates() {
        let text = prose(40);
        let chunks = split(&text, 180, 0).unwrap();
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let p1 = format!("{}\n\n", "alpha ".repeat(10));
        let p2 = "beta ".repeat(12);
        let text = format!("{p1}{p2}");

        let chunks = split(&text, 100, 10).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], p1);
        assert!(chunks[1].ends_with(p2.as_str()));
    }

    #[test]
    fn test_hard_block_inside_prose() {
        let text = format!("Intro sentence here. {} closing words", "x".repeat(250));
        let chunks = split(&text, 100, 20).unwrap();

        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
        assert!(chunks.iter().any(|c| c == &"x".repeat(100)));
        assert!(chunks.last().unwrap().ends_with("closing words"));
    }

    #[test]
    fn test_multibyte_characters() {
        let text = "é".repeat(25);
        let chunks = split(&text, 10, 0).unwrap();
        assert_eq!(lengths(&chunks), vec![10, 10, 5]);
    }

    #[test]
    fn test_split_keeping_preserves_bytes() {
        let parts = split_keeping("one. two! three? four", &[". ", "! ", "? "]);
        assert_eq!(parts, vec!["one. ", "two! ", "three? ", "four"]);
        assert_eq!(parts.concat(), "one. two! three? four");
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("hello", 0), "");
        assert_eq!(tail_chars("hello", 2), "lo");
        assert_eq!(tail_chars("hi", 5), "hi");
        assert_eq!(tail_chars("añb", 2), "ñb");
    }
}
