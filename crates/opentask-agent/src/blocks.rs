//! Code block parsing and the task-scoped block registry.
//!
//! LLM replies carry code inside paired HTML-comment markers:
//!
//! ````text
//! <!-- Block-Start: {"id":"abc123","path":"main.py"} -->
//! ```python
//! print("hello")
//! ```
//! <!-- Block-End: {"id":"abc123"} -->
//! <!-- Cmd-Exec: {"id":"abc123"} -->
//! ````
//!
//! The registry owns every block accepted over the task's lifetime; ids are
//! unique across the whole conversation, and a `Cmd-Exec` may reference any
//! previously accepted block, not just ones from the current reply.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static BLOCK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<!--\s*Block-Start:\s*(\{.*?\})\s*-->\s*```(\w+)?\s*\n(.*?)\n```\s*<!--\s*Block-End:\s*(\{.*?\})\s*-->",
    )
    .unwrap()
});

static COMMAND_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--\s*Cmd-(\w+):\s*(\{.*?\})\s*-->").unwrap());

// ---------------------------------------------------------------------------
// Code blocks
// ---------------------------------------------------------------------------

/// A parsed code block.  Immutable after creation.
#[derive(Debug, Clone, Serialize)]
pub struct CodeBlock {
    /// Globally unique id across the task's entire conversation.
    pub id: String,
    /// Language tag from the fence info string.
    pub lang: String,
    /// The code itself.
    pub code: String,
    /// Optional relative path the block was materialized to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl CodeBlock {
    /// Write the code to the block's `path`, creating parent directories.
    fn save(&self) -> std::io::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, &self.code)
    }
}

// ---------------------------------------------------------------------------
// Parse result
// ---------------------------------------------------------------------------

/// An error recorded while parsing a reply.  Errors are fed back to the
/// model verbatim, so each carries the offending fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ParseError {
    /// Malformed JSON in a start/end marker or command payload.
    JsonDecode { json_str: String, reason: String },
    /// Start and end markers carry different ids.
    IdMismatch { start_id: String, end_id: String },
    /// The id already exists in the registry or earlier in the same reply.
    DuplicateId { id: String },
    /// A `Cmd-Exec` payload without an `id` field.
    ExecMissingId { json_str: String },
    /// A `Cmd-Exec` referencing an id the registry does not know.
    ExecTargetMissing { id: String },
    /// A `Cmd-` marker with an unrecognized verb.
    UnknownCommand { command: String },
}

/// The outcome of parsing one reply.
#[derive(Debug, Default, Serialize)]
pub struct ParseResult {
    /// Parse errors, in document order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ParseError>,
    /// Blocks newly accepted from this reply, in document order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<CodeBlock>,
    /// Blocks to execute, in `Cmd-Exec` occurrence order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exec_blocks: Vec<CodeBlock>,
    /// A tool call extracted from a block-free reply, canonically
    /// re-serialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<String>,
}

impl ParseResult {
    /// True when the reply contained nothing actionable at all.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
            && self.blocks.is_empty()
            && self.exec_blocks.is_empty()
            && self.tool_call.is_none()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered, task-scoped mapping from block id to block.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: Vec<CodeBlock>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a reply, persisting accepted blocks into the registry.
    ///
    /// When `parse_tools_fallback` is set and the reply produced neither new
    /// blocks nor exec directives, a tool-call JSON is extracted from the
    /// text instead.
    pub fn parse(&mut self, reply: &str, parse_tools_fallback: bool) -> ParseResult {
        let mut result = ParseResult::default();

        for captures in BLOCK_PATTERN.captures_iter(reply) {
            let start_json = captures.get(1).map_or("", |m| m.as_str());
            let lang = captures.get(2).map_or("", |m| m.as_str());
            let code = captures.get(3).map_or("", |m| m.as_str());
            let end_json = captures.get(4).map_or("", |m| m.as_str());

            let (start_meta, end_meta) = match (parse_marker(start_json), parse_marker(end_json)) {
                (Ok(s), Ok(e)) => (s, e),
                (Err(reason), _) => {
                    result.errors.push(ParseError::JsonDecode {
                        json_str: start_json.to_owned(),
                        reason,
                    });
                    continue;
                }
                (_, Err(reason)) => {
                    result.errors.push(ParseError::JsonDecode {
                        json_str: end_json.to_owned(),
                        reason,
                    });
                    continue;
                }
            };

            let start_id = start_meta.get("id").and_then(Value::as_str).unwrap_or("");
            let end_id = end_meta.get("id").and_then(Value::as_str).unwrap_or("");
            if start_id.is_empty() || start_id != end_id {
                tracing::error!(start_id, end_id, "block marker id mismatch");
                result.errors.push(ParseError::IdMismatch {
                    start_id: start_id.to_owned(),
                    end_id: end_id.to_owned(),
                });
                continue;
            }

            if self.contains(start_id) || result.blocks.iter().any(|b| b.id == start_id) {
                tracing::error!(id = start_id, "duplicate block id");
                result.errors.push(ParseError::DuplicateId {
                    id: start_id.to_owned(),
                });
                continue;
            }

            let block = CodeBlock {
                id: start_id.to_owned(),
                lang: lang.to_owned(),
                code: code.to_owned(),
                path: start_meta
                    .get("path")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            };
            tracing::info!(id = %block.id, lang = %block.lang, "parsed code block");

            if let Err(e) = block.save() {
                // Reported, never fatal: the block stays usable in memory.
                tracing::warn!(id = %block.id, path = ?block.path, error = %e, "failed to save block to path");
            }

            result.blocks.push(block);
        }

        self.blocks.extend(result.blocks.iter().cloned());

        for captures in COMMAND_PATTERN.captures_iter(reply) {
            let command = captures.get(1).map_or("", |m| m.as_str());
            let json_str = captures.get(2).map_or("", |m| m.as_str());

            let meta = match parse_marker(json_str) {
                Ok(meta) => meta,
                Err(reason) => {
                    result.errors.push(ParseError::JsonDecode {
                        json_str: json_str.to_owned(),
                        reason,
                    });
                    continue;
                }
            };

            if command != "Exec" {
                result.errors.push(ParseError::UnknownCommand {
                    command: command.to_owned(),
                });
                continue;
            }

            match meta.get("id").and_then(Value::as_str) {
                None | Some("") => result.errors.push(ParseError::ExecMissingId {
                    json_str: json_str.to_owned(),
                }),
                Some(id) => match self.get(id) {
                    Some(block) => result.exec_blocks.push(block.clone()),
                    None => {
                        tracing::error!(id, "exec target not found");
                        result.errors.push(ParseError::ExecTargetMissing {
                            id: id.to_owned(),
                        });
                    }
                },
            }
        }

        if parse_tools_fallback && result.blocks.is_empty() && result.exec_blocks.is_empty() {
            if let Some(call) = opentask_mcp::extract_tool_call(reply) {
                tracing::info!("parsed tool call from reply");
                result.tool_call = Some(call);
            }
        }

        result
    }

    /// Dereference a block id.
    pub fn get(&self, id: &str) -> Option<&CodeBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// The code of a block, if the id is known.
    pub fn get_code(&self, id: &str) -> Option<String> {
        self.get(id).map(|b| b.code.clone())
    }

    /// Whether the id has been accepted at any point in the task.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All accepted blocks, in insertion order.
    pub fn blocks(&self) -> &[CodeBlock] {
        &self.blocks
    }
}

/// Parse a single-line marker JSON object.
fn parse_marker(json_str: &str) -> std::result::Result<serde_json::Map<String, Value>, String> {
    match serde_json::from_str::<Value>(json_str) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("marker payload is not a json object".into()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_with_block(id: &str, lang: &str, code: &str) -> String {
        format!(
            "<!-- Block-Start: {{\"id\":\"{id}\"}} -->\n```{lang}\n{code}\n```\n<!-- Block-End: {{\"id\":\"{id}\"}} -->\n"
        )
    }

    #[test]
    fn parses_block_and_exec_directive() {
        let mut registry = BlockRegistry::new();
        let reply = format!(
            "{}<!-- Cmd-Exec: {{\"id\":\"b1\"}} -->\n",
            reply_with_block("b1", "python", "print(\"hi\")")
        );

        let result = registry.parse(&reply, false);
        assert!(result.errors.is_empty());
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.exec_blocks.len(), 1);
        assert_eq!(result.exec_blocks[0].id, "b1");
        assert_eq!(result.exec_blocks[0].code, "print(\"hi\")");
        assert!(registry.contains("b1"));
    }

    #[test]
    fn duplicate_id_keeps_first_rejects_second() {
        let mut registry = BlockRegistry::new();
        let reply = format!(
            "{}{}",
            reply_with_block("x", "python", "first"),
            reply_with_block("x", "python", "second")
        );

        let result = registry.parse(&reply, false);
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].code, "first");
        assert_eq!(
            result.errors,
            vec![ParseError::DuplicateId { id: "x".into() }]
        );
        assert_eq!(registry.get("x").unwrap().code, "first");
    }

    #[test]
    fn duplicate_across_rounds_is_rejected() {
        let mut registry = BlockRegistry::new();
        registry.parse(&reply_with_block("a", "python", "round one"), false);

        let result = registry.parse(&reply_with_block("a", "python", "round two"), false);
        assert_eq!(
            result.errors,
            vec![ParseError::DuplicateId { id: "a".into() }]
        );
        assert_eq!(registry.get("a").unwrap().code, "round one");
    }

    #[test]
    fn exec_may_target_blocks_from_prior_rounds() {
        let mut registry = BlockRegistry::new();
        registry.parse(&reply_with_block("old", "python", "print(1)"), false);

        let result = registry.parse("<!-- Cmd-Exec: {\"id\":\"old\"} -->\n", false);
        assert!(result.errors.is_empty());
        assert_eq!(result.exec_blocks.len(), 1);
        assert_eq!(result.exec_blocks[0].id, "old");
    }

    #[test]
    fn exec_target_missing() {
        let mut registry = BlockRegistry::new();
        let result = registry.parse("<!-- Cmd-Exec: {\"id\":\"ghost\"} -->\n", false);
        assert_eq!(
            result.errors,
            vec![ParseError::ExecTargetMissing { id: "ghost".into() }]
        );
        assert!(result.exec_blocks.is_empty());
    }

    #[test]
    fn id_mismatch_skips_the_pair() {
        let mut registry = BlockRegistry::new();
        let reply = "<!-- Block-Start: {\"id\":\"a\"} -->\n```python\ncode\n```\n<!-- Block-End: {\"id\":\"b\"} -->\n";

        let result = registry.parse(reply, false);
        assert_eq!(
            result.errors,
            vec![ParseError::IdMismatch {
                start_id: "a".into(),
                end_id: "b".into()
            }]
        );
        assert!(result.blocks.is_empty());
        assert!(!registry.contains("a"));
    }

    #[test]
    fn malformed_marker_json_is_reported() {
        let mut registry = BlockRegistry::new();
        let reply = "<!-- Block-Start: {broken} -->\n```python\ncode\n```\n<!-- Block-End: {\"id\":\"a\"} -->\n";

        let result = registry.parse(reply, false);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(result.errors[0], ParseError::JsonDecode { .. }));
    }

    #[test]
    fn unknown_command_verb() {
        let mut registry = BlockRegistry::new();
        let result = registry.parse("<!-- Cmd-Launch: {\"id\":\"a\"} -->\n", false);
        assert_eq!(
            result.errors,
            vec![ParseError::UnknownCommand {
                command: "Launch".into()
            }]
        );
    }

    #[test]
    fn exec_order_follows_directive_order_not_definition_order() {
        let mut registry = BlockRegistry::new();
        let reply = format!(
            "{}{}{}<!-- Cmd-Exec: {{\"id\":\"b2\"}} -->\n<!-- Cmd-Exec: {{\"id\":\"b1\"}} -->\n<!-- Cmd-Exec: {{\"id\":\"b3\"}} -->\n",
            reply_with_block("b1", "python", "one"),
            reply_with_block("b2", "python", "two"),
            reply_with_block("b3", "python", "three"),
        );

        let result = registry.parse(&reply, false);
        let order: Vec<&str> = result.exec_blocks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(order, vec!["b2", "b1", "b3"]);
    }

    #[test]
    fn parse_is_deterministic_for_the_same_input() {
        let reply = format!(
            "{}<!-- Cmd-Exec: {{\"id\":\"p\"}} -->\n",
            reply_with_block("p", "python", "print(1)")
        );

        let mut first_registry = BlockRegistry::new();
        let first = first_registry.parse(&reply, false);
        let mut second_registry = BlockRegistry::new();
        let second = second_registry.parse(&reply, false);

        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn block_with_path_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub").join("main.py");
        let reply = format!(
            "<!-- Block-Start: {{\"id\":\"f1\",\"path\":\"{}\"}} -->\n```python\nprint(42)\n```\n<!-- Block-End: {{\"id\":\"f1\"}} -->\n",
            target.display()
        );

        let mut registry = BlockRegistry::new();
        let result = registry.parse(&reply, false);
        assert!(result.errors.is_empty());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "print(42)");
    }

    #[test]
    fn tool_call_fallback_only_when_reply_has_no_blocks() {
        let mut registry = BlockRegistry::new();

        let bare = "{\"action\": \"call_tool\", \"name\": \"search\", \"arguments\": {\"q\": \"x\"}}";
        let result = registry.parse(bare, true);
        assert!(result.tool_call.is_some());

        // A reply that defines a block never falls back to tool extraction.
        let mixed = format!("{}\n{}", reply_with_block("t1", "python", "x = 1"), bare);
        let result = registry.parse(&mixed, true);
        assert!(result.tool_call.is_none());

        // Disabled fallback extracts nothing.
        let mut fresh = BlockRegistry::new();
        let result = fresh.parse(bare, false);
        assert!(result.tool_call.is_none());
        assert!(result.is_empty());
    }

    #[test]
    fn get_code_by_id() {
        let mut registry = BlockRegistry::new();
        registry.parse(&reply_with_block("b1", "python", "x = 1"), false);
        assert_eq!(registry.get_code("b1").as_deref(), Some("x = 1"));
        assert!(registry.get_code("nope").is_none());
    }
}
