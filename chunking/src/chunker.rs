//! Sentence-based chunking with token overlap.
//!
//! Text is split into paragraphs on blank lines, then into sentences.
//! Bullet lines become standalone sentences. Sentences are packed greedily
//! into chunks that stay within `max_tokens`; when a chunk is flushed, the
//! trailing sentences that fit in `overlap_tokens` are carried into the next
//! chunk so adjacent chunks share context.
//!
//! A sentence longer than `max_tokens` is cut into word pieces (and a
//! single over-long word into character pieces) that take part in the same
//! packing and overlap logic as ordinary sentences.

use std::sync::Arc;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChunkingError, Result};
use crate::preprocessor::split_paragraphs;
use crate::tokenizer::{Tokenizer, TokenizerKind};

/// Terminal punctuation, whitespace, then an uppercase letter or digit.
/// Group 1 stays with the left sentence, group 2 starts the right one.
pub const DEFAULT_SENTENCE_SPLIT: &str = r"([.!?])\s+([A-Z0-9])";

/// A line that starts with a bullet marker.
pub const DEFAULT_BULLET_LINE: &str = r"^\s*[-•*]\s+";

/// A token-bounded span of source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk text: its sentences joined by single spaces.
    pub text: String,

    /// Sum of the token counts of the chunk's sentences.
    pub token_count: usize,

    /// Index of the first sentence in the flattened sentence list.
    pub start_sentence_index: usize,

    /// Index of the last sentence (inclusive).
    pub end_sentence_index: usize,
}

/// Configuration for [`SentenceChunker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentenceChunkerConfig {
    /// Hard cap on tokens per chunk.
    pub max_tokens: usize,

    /// Tokens carried from the end of one chunk into the next.
    pub overlap_tokens: usize,

    /// Sentence boundary pattern.
    pub sentence_split: String,

    /// Bullet marker pattern, matched at the start of a line.
    pub bullet_line: String,

    /// Token counter.
    pub tokenizer: TokenizerKind,
}

impl Default for SentenceChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            overlap_tokens: 60,
            sentence_split: DEFAULT_SENTENCE_SPLIT.to_string(),
            bullet_line: DEFAULT_BULLET_LINE.to_string(),
            tokenizer: TokenizerKind::default(),
        }
    }
}

impl SentenceChunkerConfig {
    /// Create a config with the given token budget. An overlap that does not
    /// leave room for new content is clamped to `max_tokens - 1`.
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_tokens,
            ..Self::default()
        }
        .clamped()
    }

    /// Set the tokenizer.
    pub fn with_tokenizer(mut self, tokenizer: TokenizerKind) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Set the sentence boundary pattern.
    pub fn with_sentence_split(mut self, pattern: impl Into<String>) -> Self {
        self.sentence_split = pattern.into();
        self
    }

    /// Set the bullet marker pattern.
    pub fn with_bullet_line(mut self, pattern: impl Into<String>) -> Self {
        self.bullet_line = pattern.into();
        self
    }

    /// Clamp `overlap_tokens` below `max_tokens`.
    pub fn clamped(mut self) -> Self {
        if self.max_tokens > 0 && self.overlap_tokens >= self.max_tokens {
            let clamped = self.max_tokens - 1;
            warn!(
                "overlap_tokens {} >= max_tokens {}, clamping to {clamped}",
                self.overlap_tokens, self.max_tokens
            );
            self.overlap_tokens = clamped;
        }
        self
    }

    /// Reject configurations that cannot be corrected.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(ChunkingError::InvalidConfig(
                "max_tokens must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One entry of the packing buffer.
#[derive(Debug, Clone)]
struct Piece {
    text: String,
    tokens: usize,
    sentence_index: usize,
}

/// Greedy token-bounded sentence packer.
pub struct SentenceChunker {
    config: SentenceChunkerConfig,
    tokenizer: Arc<dyn Tokenizer>,
    sentence_split: Regex,
    bullet_line: Regex,
}

impl SentenceChunker {
    /// Build a chunker, loading the configured tokenizer.
    pub fn new(config: SentenceChunkerConfig) -> Result<Self> {
        let tokenizer = config.tokenizer.build_or_whitespace();
        Self::with_tokenizer(config, tokenizer)
    }

    /// Build a chunker around an explicit tokenizer.
    pub fn with_tokenizer(config: SentenceChunkerConfig, tokenizer: Arc<dyn Tokenizer>) -> Result<Self> {
        let config = config.clamped();
        config.validate()?;
        let sentence_split = compile(&config.sentence_split)?;
        let bullet_line = compile(&config.bullet_line)?;
        Ok(Self {
            config,
            tokenizer,
            sentence_split,
            bullet_line,
        })
    }

    /// The effective (clamped) configuration.
    pub fn config(&self) -> &SentenceChunkerConfig {
        &self.config
    }

    /// Count tokens with the configured tokenizer.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Chunk optional text; `None` behaves like empty input.
    pub fn chunk_opt(&self, text: Option<&str>) -> Vec<Chunk> {
        text.map(|t| self.chunk(t)).unwrap_or_default()
    }

    /// Flatten text into the ordered sentence list chunk indices refer to.
    pub fn sentences(&self, text: &str) -> Vec<String> {
        split_paragraphs(text)
            .iter()
            .flat_map(|p| self.split_sentences_keep_bullets(p))
            .collect()
    }

    /// Split `text` into ordered, token-bounded chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let sentences = self.sentences(text);
        let max = self.config.max_tokens;
        let mut chunks = Vec::new();
        let mut buf: Vec<Piece> = Vec::new();

        for (i, sentence) in sentences.iter().enumerate() {
            let tokens = self.tokenizer.count(sentence);

            if tokens > max {
                for piece in self.split_long_sentence(sentence) {
                    let piece_tokens = self.tokenizer.count(&piece);
                    if buffer_tokens(&buf) + piece_tokens > max && !buf.is_empty() {
                        chunks.push(to_chunk(&buf));
                        buf = self.overlap_tail(&buf, piece_tokens);
                    }
                    if piece_tokens > max {
                        warn!("Piece of {piece_tokens} tokens exceeds max_tokens {max} and cannot be split further");
                    }
                    buf.push(Piece {
                        text: piece,
                        tokens: piece_tokens,
                        sentence_index: i,
                    });
                }
                continue;
            }

            if !buf.is_empty() && buffer_tokens(&buf) + tokens > max {
                chunks.push(to_chunk(&buf));
                buf = self.overlap_tail(&buf, tokens);
            }
            buf.push(Piece {
                text: sentence.clone(),
                tokens,
                sentence_index: i,
            });
        }

        if !buf.is_empty() {
            chunks.push(to_chunk(&buf));
        }

        debug!(
            "Chunked {} sentences into {} chunks (max {max}, overlap {})",
            sentences.len(),
            chunks.len(),
            self.config.overlap_tokens
        );
        chunks
    }

    /// Bullet lines become their own sentence; other lines in a block are
    /// joined and split on sentence boundaries.
    fn split_sentences_keep_bullets(&self, paragraph: &str) -> Vec<String> {
        let mut blocks: Vec<String> = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        let flush = |pending: &mut Vec<&str>, blocks: &mut Vec<String>| {
            if !pending.is_empty() {
                blocks.push(pending.join(" ").trim().to_string());
                pending.clear();
            }
        };

        for line in paragraph.split('\n') {
            if line.trim().is_empty() {
                flush(&mut pending, &mut blocks);
                continue;
            }
            if let Some(marker) = self.bullet_line.find(line) {
                flush(&mut pending, &mut blocks);
                blocks.push(line[marker.end()..].trim().to_string());
            } else {
                pending.push(line.trim());
            }
        }
        flush(&mut pending, &mut blocks);

        blocks
            .iter()
            .flat_map(|block| split_sentences_with(block, &self.sentence_split))
            .collect()
    }

    /// Cut an over-long sentence into word pieces of at most `max_tokens`.
    fn split_long_sentence(&self, sentence: &str) -> Vec<String> {
        let max = self.config.max_tokens;
        let mut pieces = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for word in sentence.split_whitespace() {
            if self.tokenizer.count(word) > max {
                if !current.is_empty() {
                    pieces.push(current.join(" "));
                    current.clear();
                }
                pieces.extend(self.split_long_word(word));
                continue;
            }
            current.push(word);
            if current.len() > 1 && self.tokenizer.count(&current.join(" ")) > max {
                current.pop();
                pieces.push(current.join(" "));
                current = vec![word];
            }
        }
        if !current.is_empty() {
            pieces.push(current.join(" "));
        }
        pieces
    }

    /// Hard-split a single word by characters.
    fn split_long_word(&self, word: &str) -> Vec<String> {
        let max = self.config.max_tokens;
        let mut pieces = Vec::new();
        let mut current = String::new();

        for ch in word.chars() {
            current.push(ch);
            if current.chars().count() > 1 && self.tokenizer.count(&current) > max {
                current.pop();
                pieces.push(std::mem::take(&mut current));
                current.push(ch);
            }
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    /// Trailing pieces of `flushed` totalling at most `overlap_tokens`,
    /// trimmed from the front so that `incoming` tokens still fit.
    fn overlap_tail(&self, flushed: &[Piece], incoming: usize) -> Vec<Piece> {
        let mut tail: Vec<Piece> = Vec::new();
        let mut total = 0;
        for piece in flushed.iter().rev() {
            if total + piece.tokens > self.config.overlap_tokens {
                break;
            }
            total += piece.tokens;
            tail.push(piece.clone());
        }
        tail.reverse();

        while !tail.is_empty() && total + incoming > self.config.max_tokens {
            total -= tail.remove(0).tokens;
        }
        tail
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ChunkingError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn buffer_tokens(buf: &[Piece]) -> usize {
    buf.iter().map(|p| p.tokens).sum()
}

fn to_chunk(buf: &[Piece]) -> Chunk {
    let text = buf.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join(" ");
    Chunk {
        text,
        token_count: buffer_tokens(buf),
        start_sentence_index: buf.first().map(|p| p.sentence_index).unwrap_or_default(),
        end_sentence_index: buf.last().map(|p| p.sentence_index).unwrap_or_default(),
    }
}

/// Split a block on every match of `boundary`. When the pattern has capture
/// groups, group 1 ends the left sentence and group 2 begins the right one;
/// otherwise the whole match is treated as the separator.
pub(crate) fn split_sentences_with(block: &str, boundary: &Regex) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for caps in boundary.captures_iter(block) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let left_end = caps.get(1).map(|m| m.end()).unwrap_or(whole.start());
        let right_start = caps.get(2).map(|m| m.start()).unwrap_or(whole.end());
        if left_end > start {
            sentences.push(block[start..left_end].trim().to_string());
        }
        start = right_start;
    }
    if start < block.len() {
        sentences.push(block[start..].trim().to_string());
    }

    sentences.retain(|s| !s.is_empty());
    sentences
}
