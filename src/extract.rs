//! Tolerant JSON extraction from free-form model output.
//!
//! Models often wrap valid JSON in prose or code fences. [`extract_json`]
//! tries, in order, until one parses:
//!
//! 1. the whole trimmed text;
//! 2. the body of every fenced code block (optionally language-tagged), in
//!    order of appearance;
//! 3. the span from the first `{` to the last `}`;
//! 4. the span from the first `[` to the last `]`.
//!
//! # Example
//!
//! ```
//! use vision_batch::extract::extract_json;
//!
//! let value = extract_json("Here you go:\n```json\n{\"total\": 12.5}\n```").unwrap();
//! assert_eq!(value["total"], 12.5);
//! ```

use serde_json::Value;
use thiserror::Error;

/// Why no JSON value could be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// The text was empty or whitespace only; no candidate was tried.
    #[error("empty_response")]
    EmptyResponse,
    /// Every candidate failed to parse.
    #[error("no_valid_json_found (tried {candidates} candidates)")]
    NoValidJson { candidates: usize },
}

/// Recover a JSON value from `text`. The first candidate that parses wins.
pub fn extract_json(text: &str) -> Result<Value, ExtractError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::EmptyResponse);
    }

    let candidates = candidates(trimmed);
    for candidate in &candidates {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }
    }
    Err(ExtractError::NoValidJson {
        candidates: candidates.len(),
    })
}

/// Candidate substrings in priority order.
fn candidates(text: &str) -> Vec<&str> {
    let mut out = vec![text];
    out.extend(fenced_blocks(text));
    if let Some(span) = outer_span(text, '{', '}') {
        out.push(span);
    }
    if let Some(span) = outer_span(text, '[', ']') {
        out.push(span);
    }
    out
}

/// Bodies of all ```-fenced blocks, trimmed, in order.
///
/// A fence may carry an alphanumeric language tag (```json) followed by
/// whitespace. Bodies may be on the fence lines themselves (```json {"a":1} ```). An unterminated
/// final fence is ignored.
fn fenced_blocks(text: &str) -> Vec<&str> {
    const FENCE: &str = "```";
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let run = after_open
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(after_open.len());
        // A run is a tag only when whitespace ends it; ```true``` is a body.
        let tag_len = match after_open[run..].chars().next() {
            Some(c) if c.is_whitespace() => run,
            _ => 0,
        };
        let body_start = &after_open[tag_len..];
        let Some(close) = body_start.find(FENCE) else {
            break;
        };
        let body = body_start[..close].trim();
        if !body.is_empty() {
            blocks.push(body);
        }
        rest = &body_start[close + FENCE.len()..];
    }
    blocks
}

/// Substring from the first `open` to the last `close`, inclusive.
fn outer_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}
