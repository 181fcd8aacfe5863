//! Bubble segmenter: dialogue text → chat bubbles.
//!
//! Utterances are separated by one to three `|` characters. The whole text is
//! re-split on every update, so a lone `|` that arrives at the end of a chunk
//! settles correctly once the rest of the run arrives.

use once_cell::sync::Lazy;
use regex::Regex;

pub const BUBBLE_DELIMITER: &str = "|||";

static DELIMITER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|{1,3}").expect("delimiter pattern is valid"));

/// Streaming form: interior empties are dropped, the last segment is always
/// kept (possibly empty) as the bubble currently being typed.
pub fn segment_bubbles(dialogue: &str) -> Vec<String> {
    let parts: Vec<&str> = DELIMITER.split(dialogue).collect();
    let last = parts.len().saturating_sub(1);
    parts
        .into_iter()
        .enumerate()
        .filter_map(|(i, part)| {
            let text = part.trim();
            (i == last || !text.is_empty()).then(|| text.to_string())
        })
        .collect()
}

/// Committed form: like [`segment_bubbles`] without the empty typing
/// placeholder.
pub fn finalize_bubbles(dialogue: &str) -> Vec<String> {
    let mut bubbles = segment_bubbles(dialogue);
    if bubbles.last().is_some_and(|b| b.is_empty()) {
        bubbles.pop();
    }
    bubbles
}

/// Flatten bubbles into one line, e.g. for a review card quote.
pub fn join_bubbles(bubbles: &[String]) -> String {
    bubbles.join(" ")
}
