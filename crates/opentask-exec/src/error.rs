//! Execution runtime error types.

/// Unified error type for the execution runtime.
///
/// Note that [`crate::runner::Runner::run`] itself never fails: every error
/// below is trapped and folded into the block's `errstr` so the task loop
/// can keep going.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The interpreter child process could not be launched.
    #[error("failed to launch interpreter `{interpreter}`: {reason}")]
    Launch { interpreter: String, reason: String },

    /// The child process violated the line protocol.
    #[error("interpreter protocol error: {reason}")]
    Protocol { reason: String },

    /// The child exceeded the overall execution deadline.
    #[error("block execution timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// I/O failure talking to the child process.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding failure on the protocol stream.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the exec crate.
pub type Result<T> = std::result::Result<T, ExecError>;
