//! LLM engine driver.
//!
//! The pipeline only knows the [`EngineCaller`](crate::pipeline::EngineCaller)
//! trait; this module provides the OpenAI-compatible streaming implementation
//! (llama.cpp server, OpenAI, and friends speak the same SSE dialect).

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::config::LlmSettings;
use crate::error::{Result, TurnixError};
use crate::pipeline::{ChunkStream, EngineCaller, Run};

fn engine_error(message: impl Into<String>) -> TurnixError {
    TurnixError::EngineStream {
        message: message.into(),
    }
}

/// Translate one SSE `data:` payload into a pipeline chunk. `None` for
/// `[DONE]`, keep-alives and unparseable lines.
pub fn parse_stream_data(data: &str) -> Option<Value> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let parsed: Value = serde_json::from_str(data).ok()?;
    if let Some(delta) = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
    {
        return Some(json!({"textDelta": delta}));
    }
    if let Some(usage) = parsed.get("usage") {
        if !usage.is_null() {
            return Some(json!({"usage": usage}));
        }
    }
    None
}

/// Streaming driver for OpenAI-compatible `chat/completions` endpoints.
pub struct HttpEngineCaller {
    client: reqwest::Client,
    settings: LlmSettings,
}

impl HttpEngineCaller {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn shared(settings: LlmSettings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }

    fn request_body(&self, run: &Arc<Run>) -> Value {
        let messages = run
            .get("engineRequest")
            .and_then(|req| req.get("messages").cloned())
            .unwrap_or(json!([]));
        json!({
            "model": self.settings.model,
            "messages": messages,
            "stream": true,
        })
    }
}

#[async_trait]
impl EngineCaller for HttpEngineCaller {
    async fn stream(&self, run: &Arc<Run>) -> Result<ChunkStream> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = self.request_body(run);

        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.settings.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| engine_error(format!("failed to reach engine: {err}")))?;
        if !response.status().is_success() {
            return Err(engine_error(format!(
                "engine request failed with status {}",
                response.status()
            )));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|err| engine_error(format!("stream read failed: {err}")))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);

                    if let Some(data) = line.strip_prefix("data: ") {
                        if data.trim() == "[DONE]" {
                            return;
                        }
                        if let Some(event) = parse_stream_data(data) {
                            yield event;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_deltas() {
        let data = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(parse_stream_data(data), Some(json!({"textDelta": "Hi"})));
    }

    #[test]
    fn parses_usage_chunks() {
        let data = r#"{"choices":[{"delta":{}}],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        let event = parse_stream_data(data).unwrap();
        assert_eq!(event["usage"]["total_tokens"], 8);
    }

    #[test]
    fn done_and_garbage_yield_nothing() {
        assert!(parse_stream_data("[DONE]").is_none());
        assert!(parse_stream_data("").is_none());
        assert!(parse_stream_data("not json").is_none());
        assert!(parse_stream_data(r#"{"choices":[{"delta":{}}]}"#).is_none());
    }
}
