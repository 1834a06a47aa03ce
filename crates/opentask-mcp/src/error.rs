//! Tool dispatcher error types.

/// Unified error type for the tool dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The server catalog file could not be read or parsed.
    #[error("catalog error: {reason}")]
    Catalog { reason: String },

    /// No tools are available to serve a call (dispatch disabled or the
    /// catalog is empty).
    #[error("no tools available to call")]
    NoTools,

    /// No cached tool carries the requested name.
    #[error("no tool found with name: {name}")]
    UnknownTool { name: String },

    /// Tools with the requested name exist but none accepts the given
    /// arguments.
    #[error("no suitable tool found for `{name}` with given arguments")]
    NoMatchingTool { name: String },

    /// The named server does not exist in the catalog.
    #[error("unknown server: {name}")]
    UnknownServer { name: String },

    /// A tool server child process could not be launched or initialized.
    #[error("failed to launch tool server `{server}`: {reason}")]
    ServerLaunch { server: String, reason: String },

    /// The tool call itself failed on the server.
    #[error("tool call `{tool}` failed: {reason}")]
    CallFailed { tool: String, reason: String },

    /// The call exceeded its deadline.
    #[error("tool call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure on the catalog or cache file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the dispatcher crate.
pub type Result<T> = std::result::Result<T, McpError>;
