//! # Sentence Segmentation
//!
//! Turns an incremental text stream into whole sentences so synthesis can start
//! on the first sentence while the model is still writing the rest.
//!
//! ## Key Behavior:
//! - A sentence ends at the first `.`, `!`, `?` or newline
//! - Trailing partial text is retained until more text arrives or the stream ends
//! - A piece with no words (whitespace or bare punctuation, as in an ellipsis) is never
//!   emitted on its own; it is appended to the sentence before it in the same push, or
//!   dropped

use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;

fn is_boundary(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

fn has_words(piece: &str) -> bool {
    piece.chars().any(|c| !is_boundary(c) && !c.is_whitespace())
}

/// Accumulates fragments and splits off complete sentences.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every sentence it completed, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut sentences = Vec::new();
        while let Some(idx) = self.buffer.find(is_boundary) {
            // Boundary characters are single-byte, so idx + 1 is a char boundary.
            let rest = self.buffer.split_off(idx + 1);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let trimmed = sentence.trim();
            if has_words(trimmed) {
                sentences.push(trimmed.to_string());
            } else if let Some(last) = sentences.last_mut() {
                last.push_str(trimmed);
            }
        }
        sentences
    }

    /// Emit whatever is left once the input has ended.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        has_words(trimmed).then(|| trimmed.to_string())
    }

    /// Text received but not yet emitted.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

struct SegmentState {
    fragments: BoxStream<'static, String>,
    segmenter: SentenceSegmenter,
    ready: VecDeque<String>,
    finished: bool,
}

/// Adapt a fragment stream into a sentence stream.
///
/// Sentences are yielded as soon as their boundary arrives; the retained remainder is
/// flushed when the fragment stream ends.
pub fn sentences(fragments: BoxStream<'static, String>) -> BoxStream<'static, String> {
    let state = SegmentState {
        fragments,
        segmenter: SentenceSegmenter::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(sentence) = state.ready.pop_front() {
                return Some((sentence, state));
            }
            if state.finished {
                return None;
            }
            match state.fragments.next().await {
                Some(fragment) => {
                    let completed = state.segmenter.push(&fragment);
                    state.ready.extend(completed);
                }
                None => {
                    state.finished = true;
                    state.ready.extend(state.segmenter.flush());
                }
            }
        }
    })
    .boxed()
}
