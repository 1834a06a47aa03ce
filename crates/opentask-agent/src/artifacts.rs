//! Persistent task artifacts.
//!
//! A running task auto-saves two files keyed by its 32-hex id: a JSON
//! snapshot (`{instruction, chats, runner_history, blocks}`) and an HTML
//! transcript rendered from a fixed embedded template.  `done()` renames
//! both to a name derived from the instruction.

use std::path::{Path, PathBuf};

use serde_json::Value;

/// The embedded transcript template; `{{code}}` receives the task JSON.
const TRANSCRIPT_TEMPLATE: &str = include_str!("../res/transcript.html");

/// Longest filename stem derived from an instruction.
const MAX_STEM_LENGTH: usize = 16;

/// Derive a collision-free filename from an instruction.
///
/// Strips characters that are unsafe in filenames, truncates to a short
/// prefix, and appends `_N` while a file of that name exists in `dir`.
/// Returns `None` when nothing safe remains.
pub fn get_safe_filename(dir: &Path, instruction: &str, extension: &str) -> Option<PathBuf> {
    let safe: String = instruction
        .trim()
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let safe = safe.trim();
    if safe.is_empty() {
        return None;
    }

    let stem: String = safe.chars().take(MAX_STEM_LENGTH).collect();
    let mut candidate = dir.join(format!("{stem}{extension}"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{counter}{extension}"));
        counter += 1;
    }
    Some(candidate)
}

/// Render the HTML transcript for a task snapshot.
///
/// The system prompt is dropped from the rendered chat log (it is large and
/// identical for every task of a session).
pub fn render_transcript(task: &Value) -> String {
    let mut task = task.clone();
    if let Some(chats) = task.get_mut("chats").and_then(Value::as_array_mut) {
        if chats.first().is_some_and(|m| m["role"] == "system") {
            chats.remove(0);
        }
    }

    let task_json = serde_json::to_string(&task).unwrap_or_else(|_| "{}".to_owned());
    TRANSCRIPT_TEMPLATE.replace("{{code}}", &html_escape(&task_json))
}

/// Minimal escaping for embedding JSON inside a `<pre>` element.
fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn safe_filename_strips_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = get_safe_filename(dir.path(), "list files in /tmp: *?", ".json").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "list files in tm.json");
    }

    #[test]
    fn safe_filename_counts_up_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let first = get_safe_filename(dir.path(), "report", ".html").unwrap();
        std::fs::write(&first, "x").unwrap();

        let second = get_safe_filename(dir.path(), "report", ".html").unwrap();
        assert_eq!(
            second.file_name().unwrap().to_str().unwrap(),
            "report_1.html"
        );
    }

    #[test]
    fn unsafe_only_instruction_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_safe_filename(dir.path(), "***???", ".json").is_none());
        assert!(get_safe_filename(dir.path(), "   ", ".json").is_none());
    }

    #[test]
    fn transcript_drops_leading_system_message() {
        let task = json!({
            "instruction": "do things",
            "chats": [
                {"role": "system", "content": "rules"},
                {"role": "user", "content": "do things"}
            ]
        });

        let html = render_transcript(&task);
        assert!(!html.contains("rules"));
        assert!(html.contains("do things"));
        assert!(html.contains("<pre id=\"task-data\">"));
    }

    #[test]
    fn transcript_escapes_html_in_content() {
        let task = json!({"chats": [{"role": "user", "content": "<script>alert(1)</script>"}]});
        let html = render_transcript(&task);
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
