//! Boundary-aware chunking over whitespace tokens.
//!
//! Text is tokenized on whitespace and each token keeps its byte span in the source, so every
//! chunk is an exact slice of the original document. Chunk boundaries are chosen per window:
//!
//! - Paragraph break: the last token in the window followed by a blank line.
//! - Sentence end: otherwise, the last token ending in `.`, `!` or `?` (closing quotes and
//!   brackets after the punctuation are allowed).
//! - Fixed width: otherwise, the window is cut at `chunk_size` tokens.
//!
//! A preferred boundary is only taken when the chunk keeps at least half of `chunk_size` tokens
//! and extends past the tokens carried over from the previous chunk. Each chunk after the first
//! starts with the trailing `overlap` tokens of its predecessor.

use serde::Serialize;
use thiserror::Error;

const CLOSING_PUNCTUATION: &[char] = &['"', '\'', ')', ']', '}', '\u{201d}', '\u{2019}', '\u{bb}'];

/// Errors produced while validating chunking parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkingError {
    /// Overlap must be strictly smaller than the chunk size.
    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    InvalidConfig {
        /// Requested maximum tokens per chunk.
        chunk_size: usize,
        /// Requested overlap in tokens.
        overlap: usize,
    },
}

/// Contiguous passage of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Position within the document, starting at zero.
    pub ordinal: usize,
    /// Exact source text from the first to the last token.
    pub text: String,
    /// Index of the first token.
    pub token_start: usize,
    /// Index one past the last token.
    pub token_end: usize,
    /// Byte offset of the first token.
    pub byte_start: usize,
    /// Byte offset one past the last token.
    pub byte_end: usize,
    /// Number of tokens in the chunk.
    pub token_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
    paragraph_break: bool,
    sentence_end: bool,
}

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Build a chunker, rejecting `overlap >= chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, ChunkingError> {
        if overlap >= chunk_size {
            return Err(ChunkingError::InvalidConfig {
                chunk_size,
                overlap,
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    /// Maximum tokens per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Tokens shared between consecutive chunks.
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into ordered chunks. Whitespace-only input yields no chunks.
    pub fn split(&self, text: &str) -> Vec<Chunk> {
        let tokens = tokenize(text);
        let total = tokens.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < total {
            let end = self.boundary(&tokens, start);
            chunks.push(Chunk {
                ordinal: chunks.len(),
                text: text[tokens[start].start..tokens[end - 1].end].to_string(),
                token_start: start,
                token_end: end,
                byte_start: tokens[start].start,
                byte_end: tokens[end - 1].end,
                token_count: end - start,
            });
            if end == total {
                break;
            }
            start = end - self.overlap;
        }

        chunks
    }

    fn boundary(&self, tokens: &[Token], start: usize) -> usize {
        let hard_end = (start + self.chunk_size).min(tokens.len());
        if hard_end == tokens.len() {
            return hard_end;
        }

        let min_end = (start + (self.chunk_size / 2).max(1)).max(start + self.overlap + 1);
        if min_end > hard_end {
            return hard_end;
        }
        let candidates = || (min_end..=hard_end).rev();
        candidates()
            .find(|end| tokens[end - 1].paragraph_break)
            .or_else(|| candidates().find(|end| tokens[end - 1].sentence_end))
            .unwrap_or(hard_end)
    }
}

/// Split `text` with the given parameters. See [`Chunker`] for the boundary rules.
pub fn split(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>, ChunkingError> {
    Ok(Chunker::new(chunk_size, overlap)?.split(text))
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut current: Option<usize> = None;

    for (index, ch) in text.char_indices() {
        match (ch.is_whitespace(), current) {
            (true, Some(start)) => {
                tokens.push(token(text, start, index));
                current = None;
            }
            (false, None) => current = Some(index),
            _ => {}
        }
    }
    if let Some(start) = current {
        tokens.push(token(text, start, text.len()));
    }

    for index in 0..tokens.len() {
        let gap_end = tokens.get(index + 1).map_or(text.len(), |next| next.start);
        let gap = &text[tokens[index].end..gap_end];
        tokens[index].paragraph_break = gap.matches('\n').count() >= 2;
    }
    tokens
}

fn token(text: &str, start: usize, end: usize) -> Token {
    let word = text[start..end].trim_end_matches(CLOSING_PUNCTUATION);
    Token {
        start,
        end,
        paragraph_break: false,
        sentence_end: word.ends_with(['.', '!', '?']),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|chunk| chunk.text.as_str()).collect()
    }

    fn words(count: usize) -> String {
        (0..count)
            .map(|i| format!("w{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn empty_and_whitespace_input_yield_no_chunks() {
        assert!(split("", 4, 1).expect("valid").is_empty());
        assert!(split(" \n\t  \n", 4, 1).expect("valid").is_empty());
    }

    #[test]
    fn rejects_overlap_not_smaller_than_chunk_size() {
        assert_eq!(
            split("text", 4, 4),
            Err(ChunkingError::InvalidConfig {
                chunk_size: 4,
                overlap: 4
            })
        );
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(1, 0).is_ok());
    }

    #[test]
    fn falls_back_to_fixed_windows_with_overlap() {
        let text = words(10);
        let chunks = split(&text, 4, 1).expect("valid");
        let ranges: Vec<_> = chunks
            .iter()
            .map(|chunk| (chunk.token_start, chunk.token_end))
            .collect();
        assert_eq!(ranges, [(0, 4), (3, 7), (6, 10)]);
        assert_eq!(texts(&chunks), ["w0 w1 w2 w3", "w3 w4 w5 w6", "w6 w7 w8 w9"]);
    }

    #[test]
    fn prefers_sentence_end_within_window() {
        let chunks = split("a b c. d e f g h", 5, 0).expect("valid");
        assert_eq!(texts(&chunks), ["a b c.", "d e f g h"]);
    }

    #[test]
    fn paragraph_break_wins_over_later_sentence_end() {
        let chunks = split("a. b c\n\nd e. f g", 5, 0).expect("valid");
        assert_eq!(texts(&chunks), ["a. b c", "d e. f g"]);
    }

    #[test]
    fn sentence_end_may_be_followed_by_closing_quote() {
        let chunks = split("x y \"done.\" z w v", 4, 0).expect("valid");
        assert_eq!(chunks[0].text, "x y \"done.\"");
    }

    #[test]
    fn ignores_boundaries_that_would_leave_a_short_chunk() {
        let chunks = split("a. b c d e f g", 6, 0).expect("valid");
        assert_eq!(texts(&chunks), ["a. b c d e f", "g"]);
    }

    #[test]
    fn overlap_tokens_reconstruct_the_token_stream() {
        let text = "Alpha beta gamma. Delta epsilon!\n\nZeta eta theta iota kappa. Lambda mu nu \
                    xi omicron pi rho? Sigma tau upsilon phi chi psi omega.";
        let overlap = 3;
        let chunks = split(text, 8, overlap).expect("valid");
        assert!(chunks.len() > 2);

        let mut rebuilt: Vec<&str> = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let skip = if index == 0 { 0 } else { overlap };
            rebuilt.extend(chunk.text.split_whitespace().skip(skip));
            assert!(chunk.token_count <= 8);
            assert_eq!(chunk.ordinal, index);
            assert_eq!(&text[chunk.byte_start..chunk.byte_end], chunk.text);
        }
        let original: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn consecutive_chunks_share_overlap_tokens() {
        let text = words(40);
        let chunks = split(&text, 10, 4).expect("valid");
        for pair in chunks.windows(2) {
            let tail: Vec<_> = pair[0].text.split_whitespace().rev().take(4).collect();
            let head: Vec<_> = pair[1].text.split_whitespace().take(4).collect();
            assert_eq!(tail.into_iter().rev().collect::<Vec<_>>(), head);
        }
    }

    #[test]
    fn output_is_deterministic() {
        let text = "One. Two three four.\n\nFive six seven eight nine ten eleven.";
        assert_eq!(split(text, 4, 1), split(text, 4, 1));
    }

    #[test]
    fn handles_multibyte_text() {
        let text = "café naïve résumé. über straße";
        let chunks = split(text, 3, 0).expect("valid");
        assert_eq!(texts(&chunks), ["café naïve résumé.", "über straße"]);
    }
}
