//! Stdio tool-server client.
//!
//! Each call launches the server as a child process, performs the protocol
//! `initialize`, issues exactly one `tools/list` or `tools/call`, then
//! cancels the service so stdio is fully drained and closed.  Servers are
//! never kept alive between calls.

use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::CallToolRequestParam,
    service::{RoleClient, RunningService},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::catalog::ServerConfig;
use crate::dispatcher::ToolDescriptor;
use crate::error::{McpError, Result};

/// Transport abstraction so the dispatcher can be exercised without real
/// server processes.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Launch the server and fetch its tool list.
    async fn list_tools(&self, server: &str, config: &ServerConfig) -> Result<Vec<ToolDescriptor>>;

    /// Launch the server and invoke one tool, returning the raw structured
    /// result.
    async fn call_tool(
        &self,
        server: &str,
        config: &ServerConfig,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value>;
}

/// The production transport: one child process per call over stdio.
pub struct StdioToolClient {
    /// Deadline covering launch + initialize + the single protocol call.
    call_timeout: Duration,
}

impl Default for StdioToolClient {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl StdioToolClient {
    /// Create a client with a custom per-call deadline.
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    /// Spawn the server child and complete the protocol handshake.
    async fn connect(
        &self,
        server: &str,
        config: &ServerConfig,
    ) -> Result<RunningService<RoleClient, ()>> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| McpError::ServerLaunch {
                server: server.to_owned(),
                reason: "catalog entry has no command".into(),
            })?;

        tracing::debug!(server, command, "launching tool server");

        let transport = TokioChildProcess::new(Command::new(command).configure(|cmd| {
            cmd.args(&config.args);
            cmd.envs(&config.env);
        }))
        .map_err(|e| McpError::ServerLaunch {
            server: server.to_owned(),
            reason: e.to_string(),
        })?;

        let service = tokio::time::timeout(self.call_timeout, ().serve(transport))
            .await
            .map_err(|_| McpError::Timeout {
                seconds: self.call_timeout.as_secs(),
            })?
            .map_err(|e| McpError::ServerLaunch {
                server: server.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(service)
    }

    /// Tear the service down, draining stdio.
    async fn shutdown(service: RunningService<RoleClient, ()>) {
        if let Err(e) = service.cancel().await {
            tracing::debug!(error = %e, "tool server shutdown reported an error");
        }
        // Child stdio teardown can race the process exit on Windows.
        #[cfg(windows)]
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}

#[async_trait]
impl ToolClient for StdioToolClient {
    async fn list_tools(&self, server: &str, config: &ServerConfig) -> Result<Vec<ToolDescriptor>> {
        let service = self.connect(server, config).await?;

        let listed = tokio::time::timeout(self.call_timeout, service.list_tools(Default::default()))
            .await
            .map_err(|_| McpError::Timeout {
                seconds: self.call_timeout.as_secs(),
            })
            .and_then(|r| {
                r.map_err(|e| McpError::ServerLaunch {
                    server: server.to_owned(),
                    reason: e.to_string(),
                })
            });

        // Convert before shutdown so the child is always drained, even when
        // a descriptor fails to convert.
        let result = listed.and_then(|listed| {
            listed
                .tools
                .iter()
                .map(|tool| {
                    let mut descriptor: ToolDescriptor =
                        serde_json::from_value(serde_json::to_value(tool)?)?;
                    descriptor.server = server.to_owned();
                    Ok(descriptor)
                })
                .collect::<Result<Vec<_>>>()
        });

        Self::shutdown(service).await;
        result
    }

    async fn call_tool(
        &self,
        server: &str,
        config: &ServerConfig,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value> {
        let service = self.connect(server, config).await?;

        let request = CallToolRequestParam {
            name: tool.to_owned().into(),
            arguments: Some(arguments),
        };

        let called = tokio::time::timeout(self.call_timeout, service.call_tool(request))
            .await
            .map_err(|_| McpError::Timeout {
                seconds: self.call_timeout.as_secs(),
            })
            .and_then(|r| {
                r.map_err(|e| McpError::CallFailed {
                    tool: tool.to_owned(),
                    reason: e.to_string(),
                })
            });

        let result =
            called.and_then(|outcome| serde_json::to_value(&outcome).map_err(McpError::from));

        Self::shutdown(service).await;
        result
    }
}
