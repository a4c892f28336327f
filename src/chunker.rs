//! Token-aware sentence chunker.
//!
//! Splits normalized text into windows capped by
//! `min(chunk_size, max_seq_length)` tokens with a configured overlap.
//! Sentences are packed whole; a sentence longer than the cap is split
//! by character windows with the same overlap. A char-based mode serves
//! as the fallback when no sentence boundary exists in the input.
//!
//! Token counts use the 4-chars-per-token approximation throughout.
//! Identical input and parameters always produce identical boundaries.

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token footprint of a string.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    /// Window size in tokens.
    pub chunk_size: usize,
    /// Overlap carried between adjacent windows, in tokens.
    pub overlap: usize,
    /// Embedding model input cap; the effective window is
    /// `min(chunk_size, max_seq_length)`.
    pub max_seq_length: usize,
}

impl ChunkParams {
    fn cap(&self) -> usize {
        self.chunk_size.min(self.max_seq_length).max(1)
    }

    fn effective_overlap(&self) -> usize {
        // Overlap must leave room for the window to advance.
        self.overlap.min(self.cap().saturating_sub(1))
    }
}

/// One chunk of input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub text: String,
    pub token_count: usize,
    /// Byte offset of the piece's first sentence in the input, used to
    /// assign the piece to a section.
    pub start_byte: usize,
}

/// Split text into token-capped windows on sentence boundaries.
///
/// Falls back to character windows when the input has no sentence
/// boundaries at all (e.g. minified text), keeping the same signature.
pub fn chunk_text(text: &str, params: &ChunkParams) -> Vec<ChunkPiece> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let sentences = split_sentences(text);
    if sentences.len() <= 1 && approx_tokens(text.trim()) > params.cap() {
        return chunk_text_chars(text, params);
    }

    pack_sentences(&sentences, params)
}

/// Character-window fallback used when sentence splitting is unusable.
pub fn chunk_text_chars(text: &str, params: &ChunkParams) -> Vec<ChunkPiece> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let offset = text.len() - text.trim_start().len();
    split_by_char_windows(trimmed, offset, params)
}

fn pack_sentences(sentences: &[(usize, String)], params: &ChunkParams) -> Vec<ChunkPiece> {
    let cap = params.cap();
    let overlap = params.effective_overlap();

    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut window: Vec<(usize, String)> = Vec::new();
    let mut window_tokens = 0usize;

    for (offset, sentence) in sentences {
        let tokens = approx_tokens(sentence);

        // Oversize sentence: flush, then split it by char windows.
        if tokens > cap {
            if !window.is_empty() {
                pieces.push(make_piece(&window));
                window.clear();
                window_tokens = 0;
            }
            pieces.extend(split_by_char_windows(sentence, *offset, params));
            continue;
        }

        if window_tokens + tokens > cap && !window.is_empty() {
            pieces.push(make_piece(&window));

            // Seed the next window with trailing sentences up to the
            // overlap budget.
            let mut kept: Vec<(usize, String)> = Vec::new();
            let mut kept_tokens = 0usize;
            for (o, s) in window.iter().rev() {
                let t = approx_tokens(s);
                if kept_tokens + t > overlap {
                    break;
                }
                kept.push((*o, s.clone()));
                kept_tokens += t;
            }
            kept.reverse();
            window = kept;
            window_tokens = kept_tokens;

            // The overlap never blocks progress: drop it if the incoming
            // sentence would not fit beside it.
            if window_tokens + tokens > cap {
                window.clear();
                window_tokens = 0;
            }
        }

        window.push((*offset, sentence.clone()));
        window_tokens += tokens;
    }

    if !window.is_empty() {
        pieces.push(make_piece(&window));
    }

    pieces
}

fn make_piece(window: &[(usize, String)]) -> ChunkPiece {
    let text = window
        .iter()
        .map(|(_, s)| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    ChunkPiece {
        token_count: approx_tokens(&text),
        start_byte: window[0].0,
        text,
    }
}

/// Split into `(byte_offset, sentence)` pairs. A sentence ends after
/// `.`, `!`, or `?` followed by whitespace, or at a newline.
fn split_sentences(text: &str) -> Vec<(usize, String)> {
    let mut out: Vec<(usize, String)> = Vec::new();
    let mut start = 0usize;
    let mut prev_terminator = false;

    for (idx, ch) in text.char_indices() {
        if ch == '\n' {
            push_sentence(text, start, idx, &mut out);
            start = idx + ch.len_utf8();
            prev_terminator = false;
            continue;
        }
        if prev_terminator && ch.is_whitespace() {
            push_sentence(text, start, idx, &mut out);
            start = idx;
        }
        prev_terminator = matches!(ch, '.' | '!' | '?');
    }
    push_sentence(text, start, text.len(), &mut out);

    out
}

fn push_sentence(text: &str, start: usize, end: usize, out: &mut Vec<(usize, String)>) {
    if start >= end {
        return;
    }
    let raw = &text[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let offset = start + (raw.len() - raw.trim_start().len());
    out.push((offset, trimmed.to_string()));
}

fn split_by_char_windows(text: &str, base_offset: usize, params: &ChunkParams) -> Vec<ChunkPiece> {
    let cap = params.cap();
    let overlap = params.effective_overlap();
    let window_chars = cap * CHARS_PER_TOKEN;
    let step_chars = (cap - overlap) * CHARS_PER_TOKEN;

    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = boundaries.len() - 1;

    let mut pieces = Vec::new();
    let mut start_char = 0usize;
    loop {
        let end_char = (start_char + window_chars).min(total_chars);
        let slice = &text[boundaries[start_char]..boundaries[end_char]];
        let trimmed = slice.trim();
        if !trimmed.is_empty() {
            let lead = slice.len() - slice.trim_start().len();
            pieces.push(ChunkPiece {
                text: trimmed.to_string(),
                token_count: approx_tokens(trimmed),
                start_byte: base_offset + boundaries[start_char] + lead,
            });
        }
        if end_char >= total_chars {
            break;
        }
        start_char += step_chars;
    }

    pieces
}

/// Leading-sentence extractive summary capped at `max_tokens`.
///
/// Deterministic and model-free, used for budget-constrained preload
/// blocks and compacted tool outputs.
pub fn summarize_extractive(text: &str, max_tokens: usize) -> String {
    let budget_chars = max_tokens * CHARS_PER_TOKEN;
    let mut out = String::new();
    for (_, sentence) in split_sentences(text) {
        let projected = out.chars().count() + sentence.chars().count() + 1;
        if !out.is_empty() && projected > budget_chars {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&sentence);
        if out.chars().count() >= budget_chars {
            break;
        }
    }
    if out.chars().count() > budget_chars {
        out = out.chars().take(budget_chars).collect();
    }
    out
}
