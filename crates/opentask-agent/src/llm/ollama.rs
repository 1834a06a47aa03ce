//! Ollama-shaped local model client.
//!
//! Ollama streams line-delimited JSON objects: content lives in
//! `message.content`, and the final object carries `done: true` plus the
//! token counters (`prompt_eval_count` / `eval_count`).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::history::{ChatMessage, Role, Usage, WireMessage};
use crate::llm::ChatClient;
use crate::llm::stream::StreamSink;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct OllamaClient {
    name: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    stream: bool,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(name: &str, config: &LlmConfig, default_max_tokens: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)))
            .build()
            .map_err(|e| AgentError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            name: name.to_owned(),
            model: config.model.clone().unwrap_or_default(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_owned(),
            max_tokens: config.max_tokens.unwrap_or(default_max_tokens),
            stream: config.stream,
            http,
        })
    }

    fn parse_usage(tail: &Value) -> Usage {
        let input = tail["prompt_eval_count"].as_u64().unwrap_or(0);
        let output = tail["eval_count"].as_u64().unwrap_or(0);
        Usage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            time: 0.0,
        }
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
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let event: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed stream line");
                        continue;
                    }
                };

                if event["done"].as_bool() == Some(true) {
                    usage = Self::parse_usage(&event);
                    return Ok(usage);
                }
                if let Some(content) = event["message"]["content"].as_str() {
                    sink.push(content, false);
                }
            }
        }

        Ok(usage)
    }
}

#[async_trait]
impl ChatClient for OllamaClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn usable(&self) -> bool {
        !self.model.is_empty() && !self.base_url.is_empty()
    }

    async fn complete(
        &self,
        messages: &[WireMessage],
        _system_prompt: Option<&str>,
        sink: &mut StreamSink,
    ) -> Result<ChatMessage> {
        let url = format!("{}/api/chat", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": serde_json::to_value(messages)?,
            "stream": self.stream,
            "options": {"num_predict": self.max_tokens},
        });

        tracing::debug!(llm = %self.name, url = %url, model = %self.model, "sending chat request");

        let response = self.http.post(&url).json(&body).send().await?;
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
            Ok(ChatMessage {
                role: Role::Assistant,
                content: v["message"]["content"].as_str().unwrap_or_default().to_owned(),
                reason: None,
                usage: Self::parse_usage(&v),
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

    #[test]
    fn requires_model_and_base_url() {
        let mut config = LlmConfig {
            kind: "ollama".into(),
            model: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            timeout: None,
            temperature: None,
            stream: true,
            enable: true,
            default: false,
        };

        let client = OllamaClient::new("local", &config, 8192).unwrap();
        assert!(!client.usable());

        config.model = Some("llama3".into());
        config.base_url = Some("http://localhost:11434/".into());
        let client = OllamaClient::new("local", &config, 8192).unwrap();
        assert!(client.usable());
        assert_eq!(client.base_url, "http://localhost:11434");
    }

    #[test]
    fn usage_from_done_tail() {
        let usage = OllamaClient::parse_usage(&json!({
            "done": true,
            "prompt_eval_count": 12,
            "eval_count": 34
        }));
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 34);
        assert_eq!(usage.total_tokens, 46);
    }
}
