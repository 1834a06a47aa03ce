//! Tool dispatcher.
//!
//! Holds the enablement state (one global switch plus a per-server table),
//! the in-memory tool cache, and the name→server resolution logic.  When a
//! tool name is offered by more than one server, the dispatcher scores each
//! candidate against the supplied arguments and picks the best fit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::cache::{file_mtime, load_cache, save_cache};
use crate::catalog::{ServerConfig, load_catalog};
use crate::client::ToolClient;
use crate::error::{McpError, Result};

/// File name of the tools cache, created next to the catalog.
const CACHE_FILE_NAME: &str = "tools_cache.json";

// ---------------------------------------------------------------------------
// Tool descriptor
// ---------------------------------------------------------------------------

/// One tool offered by a server, as cached and as shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name; not necessarily unique across servers.
    pub name: String,

    /// Human-readable description from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema for the tool's arguments (`properties` / `required`).
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,

    /// The server that offers this tool.
    #[serde(default)]
    pub server: String,
}

impl ToolDescriptor {
    /// Score this tool against a set of arguments.
    ///
    /// Returns `None` when a required parameter is missing.  Otherwise the
    /// score rewards arguments the schema knows about and penalizes extras:
    /// `matching − 0.1 × extra`.  Tools without a schema score zero but stay
    /// eligible.
    fn score(&self, arguments: &Map<String, Value>) -> Option<f64> {
        let Some(properties) = self
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
        else {
            return Some(0.0);
        };

        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if !required.iter().all(|name| arguments.contains_key(*name)) {
            return None;
        }

        let matching = arguments.keys().filter(|k| properties.contains_key(*k)).count();
        let extra = arguments.len() - matching;
        Some(matching as f64 - 0.1 * extra as f64)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Resolves and relays tool calls against a catalog of stdio servers.
pub struct ToolDispatcher {
    catalog_path: PathBuf,
    cache_path: PathBuf,
    servers: BTreeMap<String, ServerConfig>,
    server_enabled: BTreeMap<String, bool>,
    tools_cache: BTreeMap<String, Vec<ToolDescriptor>>,
    inited: bool,
    globally_enabled: bool,
    client: Arc<dyn ToolClient>,
}

impl ToolDispatcher {
    /// Load the catalog and build a dispatcher over the given transport.
    ///
    /// Dispatch starts globally disabled; per-server state comes from the
    /// catalog's `disabled` / `enabled` keys.
    pub fn new(catalog_path: impl Into<PathBuf>, client: Arc<dyn ToolClient>) -> Result<Self> {
        let catalog_path = catalog_path.into();
        let servers: BTreeMap<String, ServerConfig> =
            load_catalog(&catalog_path)?.into_iter().collect();
        let server_enabled = servers
            .iter()
            .map(|(name, config)| (name.clone(), config.initially_enabled()))
            .collect();
        let cache_path = catalog_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(CACHE_FILE_NAME);

        Ok(Self {
            catalog_path,
            cache_path,
            servers,
            server_enabled,
            tools_cache: BTreeMap::new(),
            inited: false,
            globally_enabled: false,
            client,
        })
    }

    /// Whether tool dispatch is globally enabled.
    pub fn globally_enabled(&self) -> bool {
        self.globally_enabled
    }

    /// Flip the global dispatch switch.
    pub fn set_globally_enabled(&mut self, enabled: bool) {
        self.globally_enabled = enabled;
    }

    /// List the tools of every enabled server.
    ///
    /// Returns empty when dispatch is globally disabled.  Serves from the
    /// persisted cache when it is fresh (catalog mtime matches and the file
    /// is under the age cap); otherwise launches each stdio server for a
    /// `tools/list` and persists the refreshed cache.  A server that fails
    /// to list yields an empty tool set without aborting the rest.
    pub async fn list_tools(&mut self) -> Vec<ToolDescriptor> {
        if !self.globally_enabled {
            return Vec::new();
        }

        let catalog_mtime = file_mtime(&self.catalog_path);
        if let Some(cached) = load_cache(&self.cache_path, catalog_mtime) {
            self.tools_cache = cached;
            self.inited = true;
            return self.enabled_tools();
        }

        let mut refreshed: BTreeMap<String, Vec<ToolDescriptor>> = BTreeMap::new();
        for (name, config) in &self.servers {
            if !config.is_stdio() {
                tracing::debug!(server = %name, "skipping non-stdio server");
                continue;
            }
            match self.client.list_tools(name, config).await {
                Ok(tools) => {
                    tracing::info!(server = %name, count = tools.len(), "tool list fetched");
                    refreshed.insert(name.clone(), tools);
                }
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "failed to list tools");
                    refreshed.insert(name.clone(), Vec::new());
                }
            }
        }

        self.tools_cache = refreshed;
        self.inited = true;

        if let Err(e) = save_cache(&self.cache_path, catalog_mtime, &self.tools_cache) {
            tracing::warn!(error = %e, "failed to persist tools cache");
        }

        self.enabled_tools()
    }

    /// Resolve a tool name to the best-matching server and invoke it.
    ///
    /// Candidates must carry the requested name and have all their required
    /// parameters present in `arguments`; among those, the highest-scoring
    /// one wins, first-encountered order breaking ties.
    pub async fn call_tool(&mut self, name: &str, arguments: &Map<String, Value>) -> Result<Value> {
        let all_tools = if self.inited && self.globally_enabled {
            self.enabled_tools()
        } else {
            self.list_tools().await
        };
        if all_tools.is_empty() {
            return Err(McpError::NoTools);
        }

        let matching: Vec<&ToolDescriptor> =
            all_tools.iter().filter(|t| t.name == name).collect();
        if matching.is_empty() {
            return Err(McpError::UnknownTool {
                name: name.to_owned(),
            });
        }

        let mut best: Option<(&ToolDescriptor, f64)> = None;
        for tool in matching {
            let Some(score) = tool.score(arguments) else {
                continue;
            };
            // Strict comparison keeps the first-encountered candidate on ties.
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((tool, score));
            }
        }
        let Some((tool, score)) = best else {
            return Err(McpError::NoMatchingTool {
                name: name.to_owned(),
            });
        };

        let server = tool.server.clone();
        tracing::info!(tool = name, server = %server, score, "dispatching tool call");

        let config = self
            .servers
            .get(&server)
            .ok_or_else(|| McpError::UnknownServer {
                name: server.clone(),
            })?
            .clone();

        self.client
            .call_tool(&server, &config, name, arguments.clone())
            .await
    }

    /// Handle an `enable | disable [server|*] | list` command.
    ///
    /// Returns a structured status object; invalid inputs yield
    /// `{"status": "error", "message": ...}`.
    pub async fn process_command(&mut self, args: &[String]) -> Value {
        let Some(first) = args.first() else {
            return json!({"status": "error", "message": "No arguments provided"});
        };
        let action = {
            let lowered = first.to_lowercase();
            if lowered.is_empty() {
                "list".to_owned()
            } else {
                lowered
            }
        };

        match (action.as_str(), args.len()) {
            ("enable" | "disable", 1) => {
                let enable = action == "enable";
                self.globally_enabled = enable;
                let tools_count = self.list_tools().await.len();
                json!({
                    "status": "success",
                    "action": if enable { "global_enable" } else { "global_disable" },
                    "globally_enabled": self.globally_enabled,
                    "servers": self.server_overview().await,
                    "tools_count": tools_count,
                })
            }
            ("enable" | "disable", 2) => {
                let enable = action == "enable";
                let target = args[1].as_str();

                if target == "*" {
                    for state in self.server_enabled.values_mut() {
                        *state = enable;
                    }
                    let tools_count = self.list_tools().await.len();
                    return json!({
                        "status": "success",
                        "action": format!("all_servers_{action}"),
                        "globally_enabled": self.globally_enabled,
                        "servers": self.server_overview().await,
                        "tools_count": tools_count,
                    });
                }

                if !self.servers.contains_key(target) {
                    return json!({
                        "status": "error",
                        "message": format!("Unknown server: {target}"),
                    });
                }

                self.server_enabled.insert(target.to_owned(), enable);
                let tools_count = self.list_tools().await.len();
                json!({
                    "status": "success",
                    "action": if enable { "server_enable" } else { "server_disable" },
                    "server": target,
                    "globally_enabled": self.globally_enabled,
                    "servers": self.server_overview().await,
                    "tools_count": tools_count,
                })
            }
            ("list", 1) => {
                let tools_count = self.list_tools().await.len();
                json!({
                    "status": "success",
                    "action": "list",
                    "globally_enabled": self.globally_enabled,
                    "servers": self.server_overview().await,
                    "tools_count": tools_count,
                })
            }
            _ => json!({
                "status": "error",
                "message": format!("Invalid command: {}", args.join(" ")),
            }),
        }
    }

    /// Tools from enabled servers only, in stable server order.
    fn enabled_tools(&self) -> Vec<ToolDescriptor> {
        self.tools_cache
            .iter()
            .filter(|(server, _)| *self.server_enabled.get(*server).unwrap_or(&true))
            .flat_map(|(_, tools)| tools.iter().cloned())
            .collect()
    }

    /// Per-server status map used by `process_command` responses.
    async fn server_overview(&mut self) -> Value {
        if !self.inited && self.globally_enabled {
            self.list_tools().await;
        }

        let overview: Map<String, Value> = self
            .server_enabled
            .iter()
            .map(|(name, enabled)| {
                let tools_count = self.tools_cache.get(name).map_or(0, Vec::len);
                (
                    name.clone(),
                    json!({"enabled": enabled, "tools_count": tools_count}),
                )
            })
            .collect();
        Value::Object(overview)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
