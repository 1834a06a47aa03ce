//! Anthropic-shaped Messages API client.
//!
//! The system prompt travels as a top-level `system` field rather than a
//! message, so this client reports [`ChatClient::system_prompt_as_field`]
//! and receives it on every request.  Streaming uses the event-stream
//! protocol: text arrives in `content_block_delta` events, input tokens in
//! `message_start`, output tokens in `message_delta`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::history::{ChatMessage, Role, Usage, WireMessage};
use crate::llm::ChatClient;
use crate::llm::stream::StreamSink;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct ClaudeClient {
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
    stream: bool,
    http: reqwest::Client,
}

impl ClaudeClient {
    pub fn new(name: &str, config: &LlmConfig, default_max_tokens: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)))
            .build()
            .map_err(|e| AgentError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            name: name.to_owned(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
                .trim_end_matches('/')
                .to_owned(),
            max_tokens: config.max_tokens.unwrap_or(default_max_tokens),
            temperature: config.temperature.filter(|t| (0.0..=1.0).contains(t)),
            stream: config.stream,
            http,
        })
    }

    fn build_body(&self, messages: &[WireMessage], system_prompt: Option<&str>) -> Result<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": serde_json::to_value(messages)?,
            "max_tokens": self.max_tokens,
        });
        if let Some(system) = system_prompt {
            body["system"] = json!(system);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if self.stream {
            body["stream"] = json!(true);
        }
        Ok(body)
    }

    async fn consume_stream(
        &self,
        response: reqwest::Response,
        sink: &mut StreamSink,
    ) -> Result<Usage> {
        let mut usage = Usage::default();
        let mut byte_stream = response.bytes_stream();
        let mut line_buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| AgentError::StreamError {
                reason: format!("stream read error: {e}"),
            })?;
            let text = std::str::from_utf8(&chunk).map_err(|e| AgentError::StreamError {
                reason: format!("invalid UTF-8 in stream: {e}"),
            })?;
            line_buffer.push_str(text);

            while let Some(pos) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=pos).collect();
                let Some(payload) = line.trim().strip_prefix("data:") else {
                    continue;
                };

                let event: Value = match serde_json::from_str(payload.trim()) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed stream event");
                        continue;
                    }
                };

                match event["type"].as_str() {
                    Some("content_block_delta") => {
                        let delta = &event["delta"];
                        if let Some(text) = delta["text"].as_str() {
                            sink.push(text, false);
                        } else if let Some(thinking) = delta["thinking"].as_str() {
                            sink.push(thinking, true);
                        }
                    }
                    Some("message_start") => {
                        usage.input_tokens += event["message"]["usage"]["input_tokens"]
                            .as_u64()
                            .unwrap_or(0);
                    }
                    Some("message_delta") => {
                        usage.output_tokens +=
                            event["usage"]["output_tokens"].as_u64().unwrap_or(0);
                    }
                    Some("message_stop") => {
                        usage.total_tokens = usage.input_tokens + usage.output_tokens;
                        return Ok(usage);
                    }
                    _ => {}
                }
            }
        }

        usage.total_tokens = usage.input_tokens + usage.output_tokens;
        Ok(usage)
    }
}

#[async_trait]
impl ChatClient for ClaudeClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn usable(&self) -> bool {
        !self.model.is_empty() && !self.api_key.is_empty()
    }

    fn system_prompt_as_field(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[WireMessage],
        system_prompt: Option<&str>,
        sink: &mut StreamSink,
    ) -> Result<ChatMessage> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(messages, system_prompt)?;

        tracing::debug!(llm = %self.name, url = %url, model = %self.model, "sending chat request");

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::RequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }

        if self.stream {
            let usage = self.consume_stream(response, sink).await?;
            sink.finish();
            Ok(ChatMessage {
                role: Role::Assistant,
                content: sink.content(),
                reason: sink.reason(),
                usage,
            })
        } else {
            let v: Value = response
                .json()
                .await
                .map_err(|e| AgentError::ParseFailed {
                    reason: format!("invalid JSON response: {e}"),
                })?;
            let content: String = v["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();

            let input = v["usage"]["input_tokens"].as_u64().unwrap_or(0);
            let output = v["usage"]["output_tokens"].as_u64().unwrap_or(0);
            Ok(ChatMessage {
                role: Role::Assistant,
                content,
                reason: None,
                usage: Usage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                    time: 0.0,
                },
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            kind: "claude".into(),
            model: None,
            api_key: Some("sk-ant".into()),
            base_url: None,
            max_tokens: None,
            timeout: None,
            temperature: None,
            stream: true,
            enable: true,
            default: false,
        }
    }

    #[test]
    fn defaults_and_usability() {
        let client = ClaudeClient::new("main", &config(), 8192).unwrap();
        assert_eq!(client.model, DEFAULT_MODEL);
        assert_eq!(client.base_url, DEFAULT_BASE_URL);
        assert_eq!(client.max_tokens, 8192);
        assert!(client.usable());
        assert!(client.system_prompt_as_field());
    }

    #[test]
    fn system_prompt_is_a_field_not_a_message() {
        let client = ClaudeClient::new("main", &config(), 8192).unwrap();
        let body = client
            .build_body(
                &[WireMessage {
                    role: Role::User,
                    content: "hi".into(),
                }],
                Some("the rules"),
            )
            .unwrap();

        assert_eq!(body["system"], "the rules");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(body["stream"], true);
    }
}
