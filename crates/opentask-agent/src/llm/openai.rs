//! OpenAI-shaped Chat Completions client.
//!
//! Serves every provider with this wire shape: OpenAI itself plus the
//! Gemini/DeepSeek/Grok OpenAI-compatible endpoints (selected via base URL
//! and default model).  Streaming uses SSE `choices[].delta` chunks with
//! usage reported in the stream tail when `stream_options.include_usage` is
//! set; reasoning models report thinking text as `delta.reasoning_content`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::history::{ChatMessage, Role, Usage, WireMessage};
use crate::llm::ChatClient;
use crate::llm::stream::StreamSink;

/// Fallback HTTP timeout when the provider entry does not set one.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct OpenAiClient {
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
    stream: bool,
    http: reqwest::Client,
}

impl OpenAiClient {
    /// Build a client, filling in the provider family's defaults where the
    /// config is silent.
    pub fn new(
        name: &str,
        config: &LlmConfig,
        default_max_tokens: u32,
        default_base_url: Option<&str>,
        default_model: &str,
    ) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .or_else(|| default_base_url.map(str::to_owned))
            .unwrap_or_else(|| "https://api.openai.com/v1".to_owned());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)))
            .build()
            .map_err(|e| AgentError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            name: name.to_owned(),
            model: config.model.clone().unwrap_or_else(|| default_model.to_owned()),
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            max_tokens: config.max_tokens.unwrap_or(default_max_tokens),
            temperature: config.temperature.filter(|t| (0.0..=1.0).contains(t)),
            stream: config.stream,
            http,
        })
    }

    fn build_body(&self, messages: &[WireMessage]) -> Result<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": serde_json::to_value(messages)?,
            "max_tokens": self.max_tokens,
            "stream": self.stream,
        });
        if self.stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        Ok(body)
    }

    fn parse_usage(usage: &Value) -> Usage {
        let reasoning = usage["completion_tokens_details"]["reasoning_tokens"]
            .as_u64()
            .unwrap_or(0);
        Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) + reasoning,
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
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
        // Buffer for partial lines that span chunk boundaries.
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
                let payload = payload.trim();
                if payload == "[DONE]" {
                    return Ok(usage);
                }

                let event: Value = match serde_json::from_str(payload) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed stream chunk");
                        continue;
                    }
                };

                if event.get("usage").is_some_and(|u| !u.is_null()) {
                    usage = Self::parse_usage(&event["usage"]);
                }

                let delta = &event["choices"][0]["delta"];
                if let Some(content) = delta["content"].as_str() {
                    sink.push(content, false);
                } else if let Some(reason) = delta["reasoning_content"].as_str() {
                    sink.push(reason, true);
                }
            }
        }

        Ok(usage)
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn usable(&self) -> bool {
        !self.model.is_empty() && !self.api_key.is_empty()
    }

    async fn complete(
        &self,
        messages: &[WireMessage],
        _system_prompt: Option<&str>,
        sink: &mut StreamSink,
    ) -> Result<ChatMessage> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(messages)?;

        tracing::debug!(llm = %self.name, url = %url, model = %self.model, "sending chat request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
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
            let message = &v["choices"][0]["message"];
            let content = message["content"].as_str().unwrap_or_default();
            Ok(ChatMessage {
                role: Role::Assistant,
                content: content.to_owned(),
                reason: message["reasoning_content"].as_str().map(str::to_owned),
                usage: Self::parse_usage(&v["usage"]),
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

    fn config(api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            kind: "openai".into(),
            model: None,
            api_key: api_key.map(str::to_owned),
            base_url: None,
            max_tokens: Some(1024),
            timeout: None,
            temperature: Some(0.7),
            stream: true,
            enable: true,
            default: false,
        }
    }

    #[test]
    fn defaults_are_applied() {
        let client = OpenAiClient::new("main", &config(Some("sk-1")), 8192, None, "gpt-4o").unwrap();
        assert_eq!(client.model, "gpt-4o");
        assert_eq!(client.base_url, "https://api.openai.com/v1");
        assert_eq!(client.max_tokens, 1024);
        assert!(client.usable());
    }

    #[test]
    fn missing_api_key_is_unusable() {
        let client = OpenAiClient::new("main", &config(None), 8192, None, "gpt-4o").unwrap();
        assert!(!client.usable());
    }

    #[test]
    fn body_includes_stream_options_when_streaming() {
        let client = OpenAiClient::new("main", &config(Some("sk-1")), 8192, None, "gpt-4o").unwrap();
        let body = client
            .build_body(&[WireMessage {
                role: Role::User,
                content: "hello".into(),
            }])
            .unwrap();

        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        let temperature = body["temperature"].as_f64().unwrap();
        assert!((temperature - 0.7).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_temperature_is_dropped() {
        let mut cfg = config(Some("sk-1"));
        cfg.temperature = Some(3.0);
        let client = OpenAiClient::new("main", &cfg, 8192, None, "gpt-4o").unwrap();
        let body = client.build_body(&[]).unwrap();
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn usage_counts_reasoning_tokens_as_output() {
        let usage = OpenAiClient::parse_usage(&json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "total_tokens": 150,
            "completion_tokens_details": {"reasoning_tokens": 30}
        }));
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.total_tokens, 150);
    }
}
