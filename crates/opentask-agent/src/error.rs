//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure.

/// Unified error type for the agent core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- LLM errors ----------------------------------------------------------
    /// An HTTP request to the LLM provider failed.
    #[error("llm request failed: {reason}")]
    RequestFailed { reason: String },

    /// The LLM response could not be parsed into the expected format.
    #[error("llm response parse error: {reason}")]
    ParseFailed { reason: String },

    /// The streaming connection was interrupted or produced invalid data.
    #[error("llm stream error: {reason}")]
    StreamError { reason: String },

    /// The configured provider `type` tag is not in the client registry.
    #[error("unsupported llm provider: {kind}")]
    UnsupportedProvider { kind: String },

    /// No provider in the settings is enabled and usable.
    #[error("no usable llm client configured")]
    NoUsableClient,

    // -- Configuration errors ------------------------------------------------
    /// Settings or tips file loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure on task artifacts or config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the tool dispatcher.
    #[error("tool dispatch error: {0}")]
    Mcp(#[from] opentask_mcp::McpError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::RequestFailed {
            reason: err.to_string(),
        }
    }
}
