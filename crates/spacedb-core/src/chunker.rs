//! Boundary-respecting text chunker.
//!
//! Text is first cut into sentence units (sentence terminators followed by
//! whitespace, and blank-line paragraph breaks). Units larger than the token
//! budget are hard-cut at word boundaries, and single words larger than the
//! budget at character boundaries. Units are then packed greedily into
//! passages of at most `max_tokens`, carrying up to `overlap_tokens` worth of
//! trailing units into the next passage.
//!
//! Every passage is a verbatim slice of the input (`start..end` byte offsets),
//! so the union of passage spans covers every non-whitespace character.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_tokens: 512, overlap_tokens: 64 }
    }
}

/// A passage cut from one document, before it is assigned a chunk id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub ordinal: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self { config: ChunkingConfig::default() }
    }
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        if config.max_tokens == 0 {
            return Err(Error::InvalidConfig("max_tokens must be positive".into()));
        }
        if config.overlap_tokens >= config.max_tokens {
            return Err(Error::InvalidConfig("overlap_tokens must be smaller than max_tokens".into()));
        }
        Ok(Self { config })
    }

    pub fn with_max_tokens(max_tokens: usize) -> Result<Self> {
        Self::new(ChunkingConfig { max_tokens, overlap_tokens: 0 })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `text` into ordered passages. Empty or whitespace-only input
    /// yields no passages.
    pub fn chunk(&self, text: &str) -> Vec<Passage> {
        let max = self.config.max_tokens;
        let mut units: Vec<(Range<usize>, usize)> = Vec::new();
        for sentence in sentence_spans(text) {
            let tokens = estimate_tokens(&text[sentence.clone()]);
            if tokens <= max {
                units.push((sentence, tokens));
            } else {
                for piece in hard_cut(text, sentence, max) {
                    let t = estimate_tokens(&text[piece.clone()]);
                    units.push((piece, t));
                }
            }
        }

        let mut passages = Vec::new();
        let mut window: Vec<(Range<usize>, usize)> = Vec::new();
        let mut window_tokens = 0usize;
        for (span, tokens) in units {
            if !window.is_empty() && window_tokens + tokens > max {
                passages.push(make_passage(text, &window, passages.len()));
                // carry the tail of the window forward as overlap
                let mut carried = Vec::new();
                let mut carried_tokens = 0usize;
                for (s, t) in window.iter().rev() {
                    if carried_tokens + t > self.config.overlap_tokens { break; }
                    carried_tokens += t;
                    carried.push((s.clone(), *t));
                }
                carried.reverse();
                while !carried.is_empty() && carried_tokens + tokens > max {
                    let (_, t) = carried.remove(0);
                    carried_tokens -= t;
                }
                window = carried;
                window_tokens = carried_tokens;
            }
            window_tokens += tokens;
            window.push((span, tokens));
        }
        if !window.is_empty() {
            passages.push(make_passage(text, &window, passages.len()));
        }
        passages
    }
}

fn make_passage(text: &str, window: &[(Range<usize>, usize)], ordinal: usize) -> Passage {
    let start = window[0].0.start;
    let end = window[window.len() - 1].0.end;
    Passage { ordinal, start, end, text: text[start..end].to_string() }
}

/// Roughly one token per short word; long runs without whitespace cost one
/// extra token per 8 bytes. Additive over whitespace-separated words.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().map(|w| 1 + w.len() / 8).sum()
}

/// Sentence spans, trimmed of surrounding whitespace.
fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let mut last_end = 0usize;
    let mut newlines = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c.is_whitespace() {
            if c == '\n' {
                newlines += 1;
                if newlines >= 2 {
                    if let Some(s) = start.take() { spans.push(s..last_end); }
                }
            }
            continue;
        }
        newlines = 0;
        if start.is_none() { start = Some(i); }
        last_end = i + c.len_utf8();
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |&(_, next)| next.is_whitespace());
            if at_boundary {
                if let Some(s) = start.take() { spans.push(s..last_end); }
            }
        }
    }
    if let Some(s) = start { spans.push(s..last_end); }
    spans
}

/// Cut an oversized span into pieces of at most `max_tokens` each.
fn hard_cut(text: &str, span: Range<usize>, max_tokens: usize) -> Vec<Range<usize>> {
    let max_word_bytes = (max_tokens * 8).saturating_sub(1).max(1);
    let mut words: Vec<Range<usize>> = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, c) in text[span.clone()].char_indices() {
        let i = span.start + i;
        if c.is_whitespace() {
            if let Some(s) = word_start.take() { words.push(s..i); }
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    if let Some(s) = word_start { words.push(s..span.end); }

    let mut pieces: Vec<Range<usize>> = Vec::new();
    for word in words {
        if word.len() <= max_word_bytes {
            pieces.push(word);
            continue;
        }
        let mut s = word.start;
        while s < word.end {
            let mut e = (s + max_word_bytes).min(word.end);
            while !text.is_char_boundary(e) { e -= 1; }
            if e == s {
                // budget smaller than one character; take the whole character
                e = s + text[s..].chars().next().map_or(1, char::len_utf8);
            }
            pieces.push(s..e);
            s = e;
        }
    }

    let mut out = Vec::new();
    let mut group: Option<Range<usize>> = None;
    let mut group_tokens = 0usize;
    for piece in pieces {
        let t = 1 + piece.len() / 8;
        match group.as_mut() {
            Some(g) if group_tokens + t <= max_tokens => {
                g.end = piece.end;
                group_tokens += t;
            }
            _ => {
                if let Some(g) = group.take() { out.push(g); }
                group = Some(piece);
                group_tokens = t;
            }
        }
    }
    if let Some(g) = group { out.push(g); }
    out
}
