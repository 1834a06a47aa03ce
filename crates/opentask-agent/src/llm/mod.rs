//! Multi-provider LLM clients.
//!
//! Provider families supported, keyed by the settings' `type` tag:
//!
//! | tag | wire shape |
//! |-----|------------|
//! | `openai`, `gemini`, `deepseek`, `grok` | Chat Completions (SSE deltas, usage in the stream tail) |
//! | `claude` | Messages API (system as a top-level field, event-stream text deltas) |
//! | `ollama` | line-delimited JSON with a `done: true` terminator |
//!
//! [`Client`] is the per-task session: it owns the history, injects the
//! system prompt exactly once, times each call, accumulates usage, and turns
//! provider failures into [`Role::Error`] messages that never touch the
//! history.

pub mod claude;
pub mod ollama;
pub mod openai;
pub mod stream;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use opentask_kernel::{EventBus, events};

use crate::config::{LlmConfig, Settings};
use crate::error::{AgentError, Result};
use crate::history::{ChatHistory, ChatMessage, Role, WireMessage};
use crate::llm::stream::StreamSink;

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// One configured LLM provider endpoint.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// The user-chosen name from the settings table.
    fn name(&self) -> &str;

    /// Whether the configuration is complete enough to use.
    fn usable(&self) -> bool;

    /// Providers that take the system prompt as a dedicated request field
    /// (rather than a leading `system` message) return true.
    fn system_prompt_as_field(&self) -> bool {
        false
    }

    /// Perform one completion over the wire messages, streaming deltas into
    /// the sink when the provider supports it.
    ///
    /// Returns the assistant message with its usage (time is filled in by
    /// the caller).
    async fn complete(
        &self,
        messages: &[WireMessage],
        system_prompt: Option<&str>,
        sink: &mut StreamSink,
    ) -> Result<ChatMessage>;
}

/// Instantiate a provider client from its config.
pub fn create_client(name: &str, config: &LlmConfig, default_max_tokens: u32) -> Result<Arc<dyn ChatClient>> {
    let client: Arc<dyn ChatClient> = match config.kind.as_str() {
        "openai" => Arc::new(openai::OpenAiClient::new(name, config, default_max_tokens, None, "gpt-4o")?),
        "gemini" => Arc::new(openai::OpenAiClient::new(
            name,
            config,
            default_max_tokens,
            Some("https://generativelanguage.googleapis.com/v1beta"),
            "gemini-2.5-flash",
        )?),
        "deepseek" => Arc::new(openai::OpenAiClient::new(
            name,
            config,
            default_max_tokens,
            Some("https://api.deepseek.com"),
            "deepseek-chat",
        )?),
        "grok" => Arc::new(openai::OpenAiClient::new(
            name,
            config,
            default_max_tokens,
            Some("https://api.x.ai/v1"),
            "grok-3-mini",
        )?),
        "claude" => Arc::new(claude::ClaudeClient::new(name, config, default_max_tokens)?),
        "ollama" => Arc::new(ollama::OllamaClient::new(name, config, default_max_tokens)?),
        other => {
            return Err(AgentError::UnsupportedProvider {
                kind: other.to_owned(),
            });
        }
    };
    Ok(client)
}

// ---------------------------------------------------------------------------
// Client manager
// ---------------------------------------------------------------------------

/// Builds and holds every usable provider client from the settings.
pub struct ClientManager {
    clients: BTreeMap<String, Arc<dyn ChatClient>>,
    current: String,
}

impl ClientManager {
    /// Instantiate clients for every enabled, usable provider entry.
    ///
    /// The entry marked `default = true` becomes current (first such entry
    /// wins); otherwise the first usable client does.
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut clients: BTreeMap<String, Arc<dyn ChatClient>> = BTreeMap::new();
        let mut default: Option<String> = None;
        let mut first: Option<String> = None;

        for (name, config) in &settings.llm {
            if !config.enable {
                tracing::info!(name = %name, "llm client disabled");
                continue;
            }
            let client = match create_client(name, config, settings.max_tokens) {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(name = %name, error = %e, "failed to create llm client");
                    continue;
                }
            };
            if !client.usable() {
                tracing::error!(name = %name, "llm client not usable");
                continue;
            }

            if first.is_none() {
                first = Some(name.clone());
            }
            if config.default && default.is_none() {
                default = Some(name.clone());
            }
            clients.insert(name.clone(), client);
        }

        let current = default.or(first).ok_or(AgentError::NoUsableClient)?;
        tracing::info!(default = %current, count = clients.len(), "llm clients ready");
        Ok(Self { clients, current })
    }

    /// Names of all usable clients.
    pub fn names(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }

    /// The currently selected client name.
    pub fn current_name(&self) -> &str {
        &self.current
    }

    /// Switch the current client.  Returns false for unknown names.
    pub fn use_client(&mut self, name: &str) -> bool {
        if self.clients.contains_key(name) {
            self.current = name.to_owned();
            true
        } else {
            false
        }
    }

    /// Open a fresh per-task session on the current client.
    pub fn session(&self, bus: EventBus) -> Client {
        Client::new(Arc::clone(&self.clients[&self.current]), bus)
    }

    /// Look up a client by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatClient>> {
        self.clients.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Per-task session
// ---------------------------------------------------------------------------

/// A conversation session bound to one provider client.
pub struct Client {
    current: Arc<dyn ChatClient>,
    history: ChatHistory,
    /// Retained for field-style providers, which need it on every request.
    system_prompt: Option<String>,
    bus: EventBus,
}

impl Client {
    pub fn new(client: Arc<dyn ChatClient>, bus: EventBus) -> Self {
        Self {
            current: client,
            history: ChatHistory::new(),
            system_prompt: None,
            bus,
        }
    }

    /// The provider name this session talks to.
    pub fn name(&self) -> &str {
        self.current.name()
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Switch this session to another client mid-task.
    pub fn use_client(&mut self, client: Arc<dyn ChatClient>) {
        self.current = client;
    }

    /// Send one prompt and return the provider's message.
    ///
    /// The system prompt is injected only when the history is empty, as a
    /// leading system message, or retained for providers that take it as a
    /// request field.  On provider failure an error-role message is returned
    /// and the history is left without an assistant turn (the user prompt
    /// stays, matching the retry-with-context behavior).
    pub async fn send(&mut self, prompt: &str, system_prompt: Option<&str>) -> ChatMessage {
        if self.history.is_empty() {
            if let Some(system) = system_prompt {
                if self.current.system_prompt_as_field() {
                    self.system_prompt = Some(system.to_owned());
                } else {
                    self.history.add(Role::System, system);
                }
            }
        }
        self.history.add(Role::User, prompt);

        let mut sink = StreamSink::new(self.current.name(), self.bus.clone());
        let start = Instant::now();
        let outcome = self
            .current
            .complete(
                &self.history.get_messages(),
                self.system_prompt.as_deref(),
                &mut sink,
            )
            .await;

        match outcome {
            Ok(mut message) => {
                message.usage.time = start.elapsed().as_secs_f64();
                self.history.add_message(message.clone());
                self.bus.broadcast(
                    events::RESPONSE_COMPLETE,
                    json!({"llm": self.current.name(), "content": message.content}),
                );
                message
            }
            Err(e) => {
                tracing::error!(llm = %self.current.name(), error = %e, "provider call failed");
                ChatMessage::error(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
