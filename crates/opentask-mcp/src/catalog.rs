//! Tool server catalog.
//!
//! The catalog is a JSON file of the shape
//! `{"mcpServers": {"<name>": {"command", "args", "env", "disabled"?, "enabled"?}}}`.
//! Unknown keys are ignored.  Entries carrying a `url` instead of a
//! `command` describe HTTP/SSE servers, which this dispatcher does not
//! launch; they are kept in the table so enablement toggles still apply.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{McpError, Result};

/// One server entry from the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable to launch for stdio servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments passed to the executable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment for the child process.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// `disabled: true` excludes the server from listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,

    /// `enabled: false` is the other spelling of the same thing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// HTTP/SSE endpoint; such servers are never launched over stdio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ServerConfig {
    /// Whether the catalog marks this server enabled.
    ///
    /// A server is enabled unless it carries `disabled: true` or
    /// `enabled: false`.
    pub fn initially_enabled(&self) -> bool {
        !(self.disabled == Some(true) || self.enabled == Some(false))
    }

    /// Whether this entry describes a stdio-launchable server.
    pub fn is_stdio(&self) -> bool {
        self.command.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, ServerConfig>,
}

/// Load the server catalog.
///
/// A missing file yields an empty catalog (tool dispatch simply has nothing
/// to offer); a malformed file is an error.
pub fn load_catalog(path: &Path) -> Result<HashMap<String, ServerConfig>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "tool catalog file not found");
        return Ok(HashMap::new());
    }

    let content = std::fs::read_to_string(path)?;
    let catalog: CatalogFile = serde_json::from_str(&content).map_err(|e| McpError::Catalog {
        reason: format!("invalid catalog json in {}: {e}", path.display()),
    })?;

    tracing::debug!(
        path = %path.display(),
        servers = catalog.mcp_servers.len(),
        "tool catalog loaded"
    );
    Ok(catalog.mcp_servers)
}
