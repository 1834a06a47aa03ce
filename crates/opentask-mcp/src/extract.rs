//! Tool-call extraction from free-form reply text.
//!
//! When a reply contains neither code blocks nor execute directives, the
//! model may instead have answered with a bare tool-call JSON.  Candidates
//! are taken from fenced code regions first, then from balanced `{...}`
//! spans; the first candidate that parses to an object carrying both
//! `action` and `name` (with `arguments` absent or object-typed) wins and is
//! re-serialized canonically.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static CODE_BLOCK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").unwrap());

static JSON_SPAN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\})").unwrap());

/// Extract a tool-call JSON string from reply text.
///
/// Returns the canonical single-line serialization of the first valid
/// candidate, or `None` when the text contains no tool call.
pub fn extract_tool_call(text: &str) -> Option<String> {
    let mut candidates: Vec<&str> = CODE_BLOCK_PATTERN
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    candidates.extend(
        JSON_SPAN_PATTERN
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str())),
    );

    for candidate in candidates {
        let Ok(data) = serde_json::from_str::<Value>(candidate.trim()) else {
            continue;
        };
        let Some(object) = data.as_object() else {
            continue;
        };
        if !object.contains_key("action") || !object.contains_key("name") {
            continue;
        }
        if let Some(arguments) = object.get("arguments") {
            if !arguments.is_object() {
                continue;
            }
        }

        // Canonical re-serialization, not the raw candidate text.
        return serde_json::to_string(&data).ok();
    }

    None
}
