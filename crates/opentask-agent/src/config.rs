//! Typed settings surface.
//!
//! The core consumes a TOML settings file; migration and interactive
//! configuration live outside this crate.  Example:
//!
//! ```toml
//! max_rounds = 16
//! auto_install = true
//! role = "opentask"
//!
//! [llm.main]
//! type = "claude"
//! model = "claude-sonnet-4-20250514"
//! api_key = "sk-..."
//! default = true
//!
//! [api.weather]
//! desc = "Weather lookups"
//! [api.weather.env]
//! WEATHER_KEY = ["sk-w", "api key for the weather service"]
//!
//! [mcp]
//! enable = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AgentError, Result};

/// Top-level settings for the task core.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Round cap per `run()` invocation.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Install requested packages without prompting.
    #[serde(default)]
    pub auto_install: bool,

    /// Resolve unknown env vars to their defaults without prompting.
    #[serde(default)]
    pub auto_getenv: bool,

    /// Working directory for task artifacts and block files.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Open html blocks saved to disk via the host browser.
    #[serde(default)]
    pub open_html_blocks: bool,

    /// Interpreter binary for executable blocks.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Overall deadline for one block execution, in seconds.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: u64,

    /// Default token budget for providers that do not set their own.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Role selector for the tips catalog.
    #[serde(default = "default_role")]
    pub role: String,

    /// Verbatim role segment overriding the selected role's detail.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Provider table, keyed by a user-chosen name.
    #[serde(default)]
    pub llm: BTreeMap<String, LlmConfig>,

    /// Declared external APIs, surfaced in the system prompt.
    #[serde(default)]
    pub api: BTreeMap<String, ApiConfig>,

    #[serde(default)]
    pub mcp: McpSettings,
}

fn default_max_rounds() -> u32 {
    16
}

fn default_interpreter() -> String {
    "python3".to_owned()
}

fn default_block_timeout() -> u64 {
    300
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_role() -> String {
    "opentask".to_owned()
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::parse(&content)
    }

    /// Parse settings from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("invalid settings: {e}"),
        })
    }
}

/// One LLM provider entry.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Provider family tag, looked up in the client registry.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// HTTP timeout in seconds for provider calls.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Sampling temperature; only forwarded when within `0.0..=1.0`.
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Use the provider's streaming mode.
    #[serde(default = "default_true")]
    pub stream: bool,

    #[serde(default = "default_true")]
    pub enable: bool,

    /// Marks the preferred client when several are configured.
    #[serde(default)]
    pub default: bool,
}

fn default_kind() -> String {
    "openai".to_owned()
}

fn default_true() -> bool {
    true
}

/// A declared external API: a description plus env-var bindings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub desc: Option<String>,

    /// `NAME = [value, description]` pairs.
    #[serde(default)]
    pub env: BTreeMap<String, (String, String)>,
}

/// Tool dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct McpSettings {
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self { enable: true }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_for_empty_settings() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.max_rounds, 16);
        assert_eq!(settings.interpreter, "python3");
        assert_eq!(settings.max_tokens, 8192);
        assert!(!settings.auto_install);
        assert!(settings.mcp.enable);
        assert!(settings.llm.is_empty());
    }

    #[test]
    fn full_settings_round_trip() {
        let settings = Settings::parse(
            r#"
max_rounds = 4
auto_install = true
role = "analyst"

[llm.main]
type = "claude"
model = "claude-sonnet-4-20250514"
api_key = "sk-1"
default = true

[llm.backup]
type = "ollama"
base_url = "http://localhost:11434"
enable = false

[api.weather]
desc = "Weather lookups"
[api.weather.env]
WEATHER_KEY = ["sk-w", "api key for the weather service"]

[mcp]
enable = false
"#,
        )
        .unwrap();

        assert_eq!(settings.max_rounds, 4);
        assert_eq!(settings.role, "analyst");

        let main = &settings.llm["main"];
        assert_eq!(main.kind, "claude");
        assert!(main.default);
        assert!(main.stream);

        let backup = &settings.llm["backup"];
        assert!(!backup.enable);
        assert_eq!(backup.kind, "ollama");

        let weather = &settings.api["weather"];
        assert_eq!(weather.env["WEATHER_KEY"].0, "sk-w");
        assert!(!settings.mcp.enable);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        assert!(matches!(
            Settings::parse("max_rounds = \"not a number\""),
            Err(AgentError::ConfigError { .. })
        ));
    }
}
