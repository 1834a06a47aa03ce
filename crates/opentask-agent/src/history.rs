//! Conversation history.
//!
//! An append-only message log with per-message token accounting.  The
//! history keeps the full messages (including the model's separate
//! "thinking" text when a provider exposes it); providers receive the
//! stripped [`WireMessage`] projection.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Usage accounting
// ---------------------------------------------------------------------------

/// Token and wall-clock usage for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Elapsed seconds for the call.
    #[serde(default)]
    pub time: f64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.time += other.time;
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the user (or feedback built by the task loop).
    User,
    /// Output from the LLM.
    Assistant,
    /// A provider failure, surfaced as a message instead of a panic.
    Error,
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,

    /// The model's "thinking" text, when the provider reports it separately
    /// from the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub usage: Usage,
}

impl ChatMessage {
    /// Create a message with no reasoning text or usage.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reason: None,
            usage: Usage::default(),
        }
    }

    /// Create an error-role message from a provider failure.
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }
}

/// The provider-facing projection of a message: role and content only.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Per-task usage summary derived from the history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    /// Number of assistant turns.
    pub rounds: usize,
    pub time: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Append-only conversation log with accumulated usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
    total: Usage,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a plain message.
    pub fn add(&mut self, role: Role, content: impl Into<String>) {
        self.add_message(ChatMessage::new(role, content));
    }

    /// Append a full message, accumulating its usage.
    pub fn add_message(&mut self, message: ChatMessage) {
        self.total += message.usage;
        self.messages.push(message);
    }

    /// All messages, in emission order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The provider-facing projection: roles and contents, reasoning and
    /// usage stripped.
    pub fn get_messages(&self) -> Vec<WireMessage> {
        self.messages
            .iter()
            .map(|m| WireMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    /// Per-round usage rows (one per assistant message).
    pub fn get_usage(&self) -> impl Iterator<Item = &Usage> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| &m.usage)
    }

    /// Accumulated totals plus the round count.
    pub fn get_summary(&self) -> UsageSummary {
        UsageSummary {
            rounds: self
                .messages
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .count(),
            time: self.total.time,
            input_tokens: self.total.input_tokens,
            output_tokens: self.total.output_tokens,
            total_tokens: self.total.total_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
