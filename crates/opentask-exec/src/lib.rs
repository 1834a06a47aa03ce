//! Code block execution runtime for OpenTask.
//!
//! Executes LLM-authored code blocks in a child interpreter, captures their
//! streams and structured result, threads persistent session state between
//! blocks, and mediates privileged host operations (package install,
//! env-var access, display, stdin) through confirmation gates.
//!
//! ## Modules
//!
//! - [`runner`] -- drives one child process per block over a line-oriented
//!   JSON protocol and keeps the per-task run history.
//! - [`runtime`] -- the host-side facade serving `runtime.*` calls made by
//!   executing code, with the `auto_install` / `auto_getenv` gates.
//! - [`filter`] -- env-value masking applied to results before they are fed
//!   back to the model.
//! - [`harness`] -- the embedded interpreter-side driver program.

pub mod error;
pub mod filter;
pub mod harness;
pub mod runner;
pub mod runtime;

pub use error::{ExecError, Result};
pub use filter::filter_result;
pub use runner::{BlockRef, ExecResult, RunRecord, Runner, RunnerConfig};
pub use runtime::{
    CodeResolver, DenyPrompter, EnvEntry, EnvTable, ExecRuntime, Prompter, SharedEnvTable,
};
