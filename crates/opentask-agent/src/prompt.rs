//! System prompt assembly.
//!
//! A task's system prompt is composed from four segments: the role (a
//! user-supplied override or the selected role's detail), the fixed output
//! protocol below, the role's tips, and the declared external API catalog.
//! When tool dispatch is enabled, the tool-calling protocol plus the current
//! tool descriptors are appended.

use crate::tips::Tips;

/// The fixed output protocol: block markers, the runtime surface, and the
/// feedback schema.  This text is part of the wire contract with the model.
pub const PROTOCOL_PROMPT: &str = r#"
# Output format rules
Your output must be structured Markdown following these rules.

## Multi-line code block markers
1. Every code block must be wrapped in a pair of comment markers:
   - Block start: <!-- Block-Start: { "id": "globally unique string", "path": "optional file path for this block" } -->
   - The code itself, wrapped in a Markdown code fence (```python, ```html, and so on).
   - Block end: <!-- Block-End: { "id": "the same unique string" } -->

2. Block ids must be unique for the whole conversation; an id must never be reused.

3. `path` may contain directories. Relative paths resolve against the working directory.

4. A single reply may define multiple code blocks.

5. Correct example:
<!-- Block-Start: { "id": "abc123", "path": "main.py" } -->
```python
print("hello world")
```
<!-- Block-End: { "id": "abc123" } -->

## Single-line command markers
1. Each reply may contain at most **one** `Cmd-Exec` marker, identifying the block to execute:
   - Format: <!-- Cmd-Exec: { "id": "id of the block to execute" } -->
   - Omit `Cmd-Exec` entirely when nothing needs to run.
   - The referenced block must have been defined with the block markers above.
   - `Cmd-Exec` may reference any block from the conversation history; to repeat a task, re-execute the existing block instead of emitting a copy.

2. `Cmd-Exec` only executes Python blocks. Blocks in other languages (JSON/HTML/CSS/JavaScript and so on) are never executed.

3. Correct example:
<!-- Cmd-Exec: { "id": "abc123" } -->

## Other rules
1. All embedded JSON must be written in **single-line compact form**, for example:
   <!-- Block-Start: { "id": "abc123", "path": "main.py" } -->

2. Never emit a block whose code duplicates an earlier block; reference the earlier block by id instead.

# Python code rules
- The code must run unmodified in the runtime described below.
- Handle errors appropriately: file operations, network timeouts and connection failures, type and value errors during data processing.
- Write error diagnostics to stderr when you need to separate them from normal output.
- Never call anything that exits the interpreter (exit/quit and similar).

# Python runtime description
On top of a standard Python environment the runtime provides:
- a global `runtime` object
- `set_result(**kwargs)`: record this block's result values, fed back to you as the block's result.
- `set_persistent_state(**kwargs)`: store values that survive across blocks in this task.
- `get_persistent_state(key)`: read a stored value; returns None when absent.

## `runtime.install_packages` method
- Purpose: request installation of extra packages the task needs.
- Arguments: one or more package names, e.g. 'httpx', 'requests>=2.25'.
- Returns: True on success, False on failure.

```python
if runtime.install_packages('httpx'):
    import httpx
```

## `runtime.get_env` method
- Purpose: obtain environment variables the code needs, such as API keys.
- Definition: get_env(name, default=None, desc=None); `desc` briefly states what the value is for.
- Returns: the value, or None/empty string when unavailable.

```python
value = runtime.get_env('SERVICE_KEY', desc='needed to call the service api')
if not value:
    print('SERVICE_KEY is not set', file=sys.stderr)
```

## `runtime.display` method
- Purpose: show an image.
- Definition: display(path="path/to/image.png", url="https://example.com/image.png")

## `runtime.get_code_by_id` method
- Purpose: fetch the code of a previously defined block.
- Definition: get_code_by_id(code_id); returns None when the id is unknown.

# Execution result feedback
Each executed block's result is fed back to you as a JSON object with these fields:
- `stdout`: captured standard output
- `stderr`: captured standard error
- `result`: the values recorded via `set_result`
- `errstr`: the exception message, when the block raised
- `traceback`: the exception traceback, when the block raised
- `block_id`: the id of the executed block

Empty fields are omitted from the feedback. Use the code plus the feedback to decide the next step.
"#;

/// Template for the tips segment.
const TIPS_PROMPT: &str = "\n# Knowledge and best practices\n";

/// Template for the API catalog segment.
const API_PROMPT: &str = r#"
# Available API information
Below is API information supplied by the user: keys, URLs, purposes, usage notes.
Use whatever is relevant to the task.

Notes:
1. Environment variables described here must be read with runtime.get_env, never os.getenv.
2. When an API call fails, print the complete response to ease debugging.
"#;

/// The tool-calling protocol appended when dispatch is enabled.
const TOOL_PROMPT: &str = r#"
## Tool-calling rules
1. To call an external tool, reply with your decision and call arguments as JSON, and nothing else.
2. The JSON format is:
{"action": "call_tool", "name": "tool_name", "arguments": {"arg_name": "arg_value"}}
3. Reply with exactly one tool call: a single JSON object with no surrounding content.
The tools available to you, as a JSON array:
"#;

/// Compose the immutable system prompt for a task.
///
/// `role_override` replaces the selected role's detail (and suppresses the
/// tips segment, which is role-local).
pub fn build_system_prompt(
    tips: Option<&Tips>,
    api_catalog: &str,
    role_override: Option<&str>,
) -> String {
    let role_segment = match role_override {
        Some(role) => role.trim().to_owned(),
        None => tips.map(|t| t.role.detail.trim().to_owned()).unwrap_or_default(),
    };

    let tips_segment = match (role_override, tips) {
        (None, Some(tips)) if !tips.is_empty() => {
            format!("{TIPS_PROMPT}{}\n", tips.render())
        }
        _ => String::new(),
    };

    let api_segment = if api_catalog.is_empty() {
        String::new()
    } else {
        format!("{API_PROMPT}\n{api_catalog}\n")
    };

    format!("{role_segment}\n{PROTOCOL_PROMPT}\n{tips_segment}{api_segment}")
}

/// Append the tool protocol and the current tool descriptors.
pub fn append_tool_protocol(system_prompt: &str, tools_json: &str) -> String {
    format!("{system_prompt}\n{TOOL_PROMPT}\n```json\n{tools_json}\n```\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
