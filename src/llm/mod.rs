//! Streaming client for the structured-suggestion LLM call (spec.md §4.5).
//!
//! Grounded in `examples/Rapheal7-My-Agent/src/agent/llm.rs`'s
//! `stream_complete()` (SSE request shape, bearer auth, per-delta callback)
//! and `examples/original_source/.../llm/llm_utils.py`'s `VLLMStream` /
//! `chat_completion()` (forced JSON-schema response format, 1/2/4/8s
//! rate-limit retry schedule, then give up).

pub mod partial_json;

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::OrchestratorError;
use partial_json::{Completed, PartialJsonStream};

/// Rate-limit retry backoff schedule in seconds, after which the call gives
/// up (`original_source/llm/llm_utils.py`'s `chat_completion`).
const RETRY_SCHEDULE_SECS: [u64; 4] = [1, 2, 4, 8];

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    response_format: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Forces the model to emit `{suggested_keywords: string[], suggested_answers: string[]}`
/// (`VLLMStream.get_stream`'s `response_format`).
fn structured_response_format() -> serde_json::Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "response_suggestion",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "suggested_keywords": { "type": "array", "items": { "type": "string" } },
                    "suggested_answers": { "type": "array", "items": { "type": "string" } },
                },
                "required": ["suggested_keywords", "suggested_answers"],
                "additionalProperties": false,
            },
        },
    })
}

/// Client for one LLM endpoint, addressed by base URL (the Upstream Broker
/// resolves which instance to hand us per call; this client doesn't retry
/// across instances, only across rate limits on the one it was given).
pub struct LlmClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Stream a structured-suggestion completion, invoking `on_delta` for
    /// each newly-completed keyword/answer as it becomes available.
    ///
    /// `temperature` is 0.7 for a session's first generation turn, 0.3
    /// thereafter (spec.md §4.5). Retries only on HTTP 429, at 1/2/4/8s,
    /// then fails with `OrchestratorError::RateLimited`.
    pub async fn stream_structured(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        mut on_delta: impl FnMut(Completed),
    ) -> Result<(), OrchestratorError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            temperature,
            response_format: structured_response_format(),
        };

        let (mut event_source, first_event) = self.open_with_retries(&request).await?;
        let mut parser = PartialJsonStream::new();

        let mut pending = first_event;
        loop {
            let event = match pending.take() {
                Some(event) => Some(event),
                None => event_source.next().await,
            };
            let Some(event) = event else { break };

            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    if message.data == "[DONE]" {
                        break;
                    }
                    let Ok(chunk) = serde_json::from_str::<StreamChunk>(&message.data) else {
                        continue;
                    };
                    if let Some(choice) = chunk.choices.first() {
                        if let Some(content) = &choice.delta.content {
                            for completed in parser.push(content) {
                                on_delta(completed);
                            }
                        }
                    }
                }
                Err(EsError::StreamEnded) => break,
                Err(other) => {
                    event_source.close();
                    return Err(OrchestratorError::UpstreamTransportLoss {
                        service: format!("llm: {other}"),
                    });
                }
            }
        }
        event_source.close();
        Ok(())
    }

    /// Open the SSE connection, retrying only on HTTP 429 at the 1/2/4/8s
    /// schedule (`chat_completion`'s retry loop). A 429 is only observable
    /// once the first event is polled, since `EventSource::new` is lazy; the
    /// first successfully-polled event is returned alongside the stream so
    /// the caller doesn't lose it.
    #[allow(clippy::type_complexity)]
    async fn open_with_retries(
        &self,
        request: &ChatRequest,
    ) -> Result<(EventSource, Option<Result<Event, EsError>>), OrchestratorError> {
        for retry_secs in RETRY_SCHEDULE_SECS {
            let builder = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(request);

            let mut event_source = EventSource::new(builder).map_err(|err| {
                OrchestratorError::Internal(anyhow::anyhow!("failed to build LLM request: {err}"))
            })?;

            match event_source.next().await {
                Some(Err(EsError::InvalidStatusCode(status, _))) if status.as_u16() == 429 => {
                    event_source.close();
                    tracing::warn!(retry_secs, "LLM rate limited, retrying");
                    tokio::time::sleep(Duration::from_secs(retry_secs)).await;
                }
                Some(Err(other)) => {
                    event_source.close();
                    return Err(OrchestratorError::UpstreamTransportLoss {
                        service: format!("llm: {other}"),
                    });
                }
                first => return Ok((event_source, first)),
            }
        }
        Err(OrchestratorError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_response_format_requires_both_arrays() {
        let format = structured_response_format();
        let required = format["json_schema"]["schema"]["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "suggested_keywords"));
        assert!(required.iter().any(|v| v == "suggested_answers"));
    }

    #[test]
    fn retry_schedule_matches_source() {
        assert_eq!(RETRY_SCHEDULE_SECS, [1, 2, 4, 8]);
    }
}
