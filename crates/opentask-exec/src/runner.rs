//! Block runner.
//!
//! Executes one code block at a time in a fresh interpreter child process,
//! speaking the line protocol described in [`crate::harness`].  The runner
//! owns the task's persistent session state (threaded into every child and
//! read back from its final report) and the run history used for post-task
//! diagnostics.
//!
//! `run` never fails: launch errors, protocol violations, and timeouts all
//! fold into the returned [`ExecResult`] so the task loop can keep going.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::{ExecError, Result};
use crate::filter::filter_result;
use crate::harness::PY_HARNESS;
use crate::runtime::ExecRuntime;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A borrowed view of a code block, as the runner needs it.
#[derive(Debug, Clone, Copy)]
pub struct BlockRef<'a> {
    /// The block's globally unique id.
    pub id: &'a str,
    /// Language tag from the fence info string.
    pub lang: &'a str,
    /// The code itself.
    pub code: &'a str,
    /// Where the parser materialized the block on disk, if anywhere.
    pub path: Option<&'a str>,
}

/// The outcome of executing one block.
///
/// Empty fields are omitted from serialization so the feedback sent to the
/// model only carries what actually happened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Filtered copy of the block's result bag (`set_result` values).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errstr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ExecResult {
    fn from_error(message: impl Into<String>) -> Self {
        Self {
            errstr: Some(message.into()),
            ..Self::default()
        }
    }
}

/// One entry of the task's run history.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub block_id: String,
    pub result: ExecResult,
    /// Env vars added or changed during this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_delta: Option<Value>,
    /// Persistent-state keys added or changed during this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_delta: Option<Value>,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Overall deadline for a single block execution.
    pub timeout: Duration,
    /// Whether html blocks saved to disk are opened via the host browser.
    pub open_html_blocks: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            open_html_blocks: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes blocks and keeps per-task state.
pub struct Runner {
    runtime: Arc<ExecRuntime>,
    config: RunnerConfig,
    persistent_state: Map<String, Value>,
    history: Vec<RunRecord>,
}

impl Runner {
    /// Create a runner with empty persistent state and history.
    pub fn new(runtime: Arc<ExecRuntime>, config: RunnerConfig) -> Self {
        Self {
            runtime,
            config,
            persistent_state: Map::new(),
            history: Vec::new(),
        }
    }

    /// The run history accumulated so far.
    pub fn history(&self) -> &[RunRecord] {
        &self.history
    }

    /// The current persistent session state.
    pub fn persistent_state(&self) -> &Map<String, Value> {
        &self.persistent_state
    }

    /// The runtime this runner dispatches `runtime.*` calls to.
    pub fn runtime(&self) -> &Arc<ExecRuntime> {
        &self.runtime
    }

    /// Execute one block and record the outcome.
    pub async fn run(&mut self, block: BlockRef<'_>) -> ExecResult {
        tracing::info!(block_id = block.id, lang = block.lang, "executing block");

        let env_before = self.runtime.env_values();
        let session_before = self.persistent_state.clone();

        let result = match block.lang {
            "python" => self.exec_python(block).await,
            "html" => self.exec_html(block),
            _ => ExecResult {
                stderr: Some("unsupported language".into()),
                ..ExecResult::default()
            },
        };

        let env_after: Map<String, Value> = self
            .runtime
            .env_values()
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        let env_before: Map<String, Value> = env_before
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        self.history.push(RunRecord {
            block_id: block.id.to_owned(),
            result: result.clone(),
            env_delta: diff_maps(&env_after, &env_before),
            session_delta: diff_maps(&self.persistent_state, &session_before),
        });

        result
    }

    // -----------------------------------------------------------------------
    // Python execution
    // -----------------------------------------------------------------------

    async fn exec_python(&mut self, block: BlockRef<'_>) -> ExecResult {
        let deadline = self.config.timeout;
        match tokio::time::timeout(deadline, self.drive_child(block)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(block_id = block.id, error = %e, "block execution failed");
                ExecResult::from_error(e.to_string())
            }
            Err(_) => {
                tracing::error!(block_id = block.id, timeout = ?deadline, "block execution timed out");
                ExecResult::from_error(
                    ExecError::Timeout {
                        seconds: deadline.as_secs(),
                    }
                    .to_string(),
                )
            }
        }
    }

    /// Launch the interpreter, feed it the request, serve its RPC calls,
    /// and collect the final report.
    async fn drive_child(&mut self, block: BlockRef<'_>) -> Result<ExecResult> {
        let interpreter = self.runtime.interpreter().to_owned();
        let mut child = Command::new(&interpreter)
            .arg("-c")
            .arg(PY_HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Launch {
                interpreter: interpreter.clone(),
                reason: e.to_string(),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| ExecError::Protocol {
            reason: "child stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ExecError::Protocol {
            reason: "child stdout unavailable".into(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let request = json!({
            "code": block.code,
            "env": self.runtime.env_values(),
            "persistent_state": Value::Object(self.persistent_state.clone()),
        });
        stdin
            .write_all(format!("{request}\n").as_bytes())
            .await?;
        stdin.flush().await?;

        while let Some(line) = lines.next_line().await? {
            let msg: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(line = %line, "stray non-protocol output from interpreter");
                    continue;
                }
            };

            if let Some(method) = msg.get("rpc").and_then(Value::as_str) {
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let value = dispatch_rpc(&self.runtime, method, &params).await;
                stdin
                    .write_all(format!("{}\n", json!({ "value": value })).as_bytes())
                    .await?;
                stdin.flush().await?;
                continue;
            }

            if let Some(report) = msg.get("done") {
                let result = self.finish(report);
                // Drain and reap the child so stdio is fully closed.
                drop(stdin);
                let _ = child.wait().await;
                return Ok(result);
            }

            tracing::warn!(line = %line, "unrecognized protocol line from interpreter");
        }

        let status = child.wait().await?;
        Err(ExecError::Protocol {
            reason: format!("interpreter exited without a result ({status})"),
        })
    }

    /// Fold the child's final report into an [`ExecResult`] and absorb the
    /// updated persistent state.
    fn finish(&mut self, report: &Value) -> ExecResult {
        if let Some(state) = report.get("persistent_state").and_then(Value::as_object) {
            self.persistent_state = state.clone();
        }

        let env_names = self.runtime.env_names();
        let text = |key: &str| report.get(key).and_then(Value::as_str).map(str::to_owned);

        ExecResult {
            stdout: text("stdout"),
            stderr: text("stderr"),
            result: report
                .get("result")
                .map(|v| filter_result(v, &env_names)),
            errstr: text("errstr"),
            traceback: text("traceback"),
        }
    }

    // -----------------------------------------------------------------------
    // Html blocks
    // -----------------------------------------------------------------------

    /// Html blocks are never executed; when enabled and materialized to
    /// disk, they are opened via the host browser instead.  Otherwise they
    /// get the same result as any other non-executable language.
    fn exec_html(&self, block: BlockRef<'_>) -> ExecResult {
        let unsupported = || ExecResult {
            stderr: Some("unsupported language".into()),
            ..ExecResult::default()
        };

        if !self.config.open_html_blocks {
            return unsupported();
        }

        let Some(path) = block.path else {
            return unsupported();
        };

        match open_in_browser(path) {
            Ok(()) => ExecResult {
                stdout: Some("OK".into()),
                ..ExecResult::default()
            },
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to open html block");
                ExecResult::from_error(format!("failed to open {path}: {e}"))
            }
        }
    }
}

/// Spawn the platform opener for a file path.
fn open_in_browser(path: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    let mut command = {
        let mut c = std::process::Command::new("open");
        c.arg(path);
        c
    };
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", "", path]);
        c
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut command = {
        let mut c = std::process::Command::new("xdg-open");
        c.arg(path);
        c
    };

    command.spawn().map(|_| ())
}

/// Serve one `runtime.*` call from the child.
async fn dispatch_rpc(runtime: &ExecRuntime, method: &str, params: &Value) -> Value {
    let text = |key: &str| params.get(key).and_then(Value::as_str);

    match method {
        "install_packages" => {
            let names: Vec<String> = params
                .get("names")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            json!(runtime.install_packages(&names).await)
        }
        "get_env" => {
            let name = text("name").unwrap_or_default();
            match runtime.get_env(name, text("default"), text("desc")) {
                Some(value) => Value::String(value),
                None => Value::Null,
            }
        }
        "display" => {
            runtime.display(text("path"), text("url"));
            Value::Null
        }
        "input" => Value::String(runtime.input(text("prompt").unwrap_or_default())),
        "get_code_by_id" => {
            let id = text("id").unwrap_or_default();
            match runtime.get_code_by_id(id) {
                Some(code) => Value::String(code),
                None => Value::Null,
            }
        }
        other => {
            tracing::warn!(method = other, "unknown runtime rpc from interpreter");
            Value::Null
        }
    }
}

/// Entries of `after` that are new or changed relative to `before`.
fn diff_maps(after: &Map<String, Value>, before: &Map<String, Value>) -> Option<Value> {
    let delta: Map<String, Value> = after
        .iter()
        .filter(|&(k, v)| before.get(k) != Some(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (!delta.is_empty()).then_some(Value::Object(delta))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
