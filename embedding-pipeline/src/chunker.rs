use std::sync::Arc;

use common::error::AppError;
use serde::{Deserialize, Serialize};

/// How text is sliced before embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingMode {
    /// One span covering the whole text.
    None,
    /// Contiguous spans of at most `chunk_size` tokens.
    Fixed,
    /// Spans end on sentence boundaries where possible.
    #[default]
    Sentence,
}

/// A chunk's position, in tokens and in bytes of the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub token_span: (usize, usize),
    pub char_span: (usize, usize),
}

/// Anything that can report per-token byte offsets for a text.
///
/// The production implementation wraps a HuggingFace tokenizer; the
/// whitespace fallback keeps the pipeline usable without a tokenizer file
/// (one word approximates one token).
pub trait Tokenize: Send + Sync {
    fn token_offsets(&self, text: &str) -> Result<Vec<(usize, usize)>, AppError>;
}

/// `Tokenize` backed by a `tokenizers` definition file.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &str) -> Result<Self, AppError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| AppError::InternalError(format!("failed to load tokenizer: {e}")))?;
        Ok(Self { inner })
    }
}

impl Tokenize for HfTokenizer {
    fn token_offsets(&self, text: &str) -> Result<Vec<(usize, usize)>, AppError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| AppError::InternalError(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_offsets().to_vec())
    }
}

/// Word-level tokenizer: whitespace separates tokens and the sentence
/// terminators `.`, `!`, `?` are tokens of their own, mirroring how subword
/// tokenizers emit them.
pub struct WhitespaceTokenizer;

impl Tokenize for WhitespaceTokenizer {
    fn token_offsets(&self, text: &str) -> Result<Vec<(usize, usize)>, AppError> {
        let mut offsets = Vec::new();
        let mut start: Option<usize> = None;
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                if let Some(s) = start.take() {
                    offsets.push((s, i));
                }
            } else if matches!(c, '.' | '!' | '?') {
                if let Some(s) = start.take() {
                    offsets.push((s, i));
                }
                offsets.push((i, i + c.len_utf8()));
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            offsets.push((s, text.len()));
        }
        Ok(offsets)
    }
}

/// Splits text into embedding-sized spans over a tokenizer's offsets.
///
/// Pure and stateless per call; `chunk_async` offloads the token walk to the
/// blocking pool since tokenization is CPU-bound.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_model_len: usize,
}

impl Chunker {
    pub fn new(max_model_len: usize) -> Self {
        Self { max_model_len }
    }

    pub fn chunk(
        &self,
        text: &str,
        chunk_size: usize,
        mode: ChunkingMode,
        tokenizer: &dyn Tokenize,
    ) -> Result<Vec<ChunkSpan>, AppError> {
        if text.is_empty() || chunk_size == 0 {
            return Ok(Vec::new());
        }
        self.check_text_length(text)?;

        let offsets = tokenizer.token_offsets(text)?;
        if offsets.is_empty() {
            return Ok(Vec::new());
        }

        match mode {
            ChunkingMode::None => Ok(vec![ChunkSpan {
                token_span: (0, offsets.len()),
                char_span: (0, text.len()),
            }]),
            ChunkingMode::Fixed => Ok(chunk_by_tokens(text, chunk_size, &offsets)),
            ChunkingMode::Sentence => Ok(chunk_by_sentences(text, chunk_size, &offsets)),
        }
    }

    pub async fn chunk_async(
        &self,
        text: String,
        chunk_size: usize,
        mode: ChunkingMode,
        tokenizer: Arc<dyn Tokenize>,
    ) -> Result<Vec<ChunkSpan>, AppError> {
        let chunker = *self;
        tokio::task::spawn_blocking(move || chunker.chunk(&text, chunk_size, mode, &*tokenizer))
            .await?
    }

    /// Reject text that cannot fit the model before paying for tokenization.
    /// ~4 chars per token is a conservative estimate.
    fn check_text_length(&self, text: &str) -> Result<(), AppError> {
        let limit = self.max_model_len.saturating_mul(4);
        if limit > 0 && text.len() > limit {
            return Err(AppError::TextTooLong {
                length: text.len(),
                limit,
            });
        }
        Ok(())
    }
}

/// Fixed-size token windows. Each span starts where the previous ended so the
/// whitespace between tokens stays covered and the spans are gapless.
fn chunk_by_tokens(text: &str, chunk_size: usize, offsets: &[(usize, usize)]) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut prev_char_end = 0;
    let mut i = 0;
    while i < offsets.len() {
        let end = (i + chunk_size).min(offsets.len());
        let char_start = prev_char_end;
        let char_end = offsets.get(end - 1).map_or(0, |o| o.1);
        if char_start < char_end && char_end <= text.len() {
            spans.push(ChunkSpan {
                token_span: (i, end),
                char_span: (char_start, char_end),
            });
            prev_char_end = char_end;
        }
        i = end;
    }
    spans
}

/// Sentence-bounded spans of at most `chunk_size` tokens.
///
/// A sentence boundary is a terminator token (`.`, `!`, `?`) not glued to the
/// following token. A single sentence longer than `chunk_size` becomes its
/// own oversized span; it is never split mid-sentence. Spans after the first
/// start where the previous one ended, keeping the sequence gapless.
fn chunk_by_sentences(text: &str, chunk_size: usize, offsets: &[(usize, usize)]) -> Vec<ChunkSpan> {
    let mut spans: Vec<ChunkSpan> = Vec::new();
    let mut chunk_start = 0usize;
    let mut last_sentence_end = 0usize;
    let mut prev_char_end: Option<usize> = None;

    for i in 0..offsets.len() {
        let (tok_start, tok_end) = match offsets.get(i) {
            Some(o) => *o,
            None => break,
        };
        let token = text.get(tok_start..tok_end).unwrap_or("");
        let is_terminator = matches!(token, "." | "!" | "?");
        let detached_from_next = match offsets.get(i + 1) {
            Some(next) => tok_end != next.0,
            None => true,
        };

        if is_terminator && detached_from_next {
            let sentence_end = i + 1;
            let chunk_tokens = sentence_end - chunk_start;

            if chunk_tokens > chunk_size && last_sentence_end > chunk_start {
                if let Some(span) = make_span(
                    text,
                    offsets,
                    chunk_start,
                    last_sentence_end,
                    prev_char_end,
                ) {
                    prev_char_end = Some(span.char_span.1);
                    spans.push(span);
                }
                chunk_start = last_sentence_end;
            }
            last_sentence_end = sentence_end;
        }
    }

    if chunk_start < offsets.len() {
        if let Some(span) = make_span(text, offsets, chunk_start, offsets.len(), prev_char_end) {
            spans.push(span);
        }
    }

    spans
}

fn make_span(
    text: &str,
    offsets: &[(usize, usize)],
    token_start: usize,
    token_end: usize,
    prev_char_end: Option<usize>,
) -> Option<ChunkSpan> {
    let first = offsets.get(token_start)?;
    let last = offsets.get(token_end.checked_sub(1)?)?;
    let char_start = prev_char_end.unwrap_or(first.0);
    let char_end = last.1;
    if char_start < char_end && char_end <= text.len() {
        Some(ChunkSpan {
            token_span: (token_start, token_end),
            char_span: (char_start, char_end),
        })
    } else {
        None
    }
}
