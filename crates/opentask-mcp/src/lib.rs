//! External tool dispatcher for OpenTask.
//!
//! Tool servers are child processes speaking the Model Context Protocol over
//! stdio.  This crate loads the server catalog, caches each server's tool
//! list next to the catalog file, resolves a model-chosen tool name to the
//! best-matching server by argument schema, and relays calls.
//!
//! ## Modules
//!
//! - [`catalog`] -- the `mcpServers` catalog file.
//! - [`cache`] -- the sibling tools-cache file with mtime/age invalidation.
//! - [`client`] -- the stdio transport (one child process per call).
//! - [`dispatcher`] -- enablement state, listing, scoring, command handling.
//! - [`extract`] -- pulling a tool-call JSON out of free-form reply text.

pub mod cache;
pub mod catalog;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod extract;

pub use catalog::{ServerConfig, load_catalog};
pub use client::{StdioToolClient, ToolClient};
pub use dispatcher::{ToolDescriptor, ToolDispatcher};
pub use error::{McpError, Result};
pub use extract::extract_tool_call;
