//! The realtime session protocol: a small tagged-union event model modeled
//! after OpenAI's Realtime API, matching `type`-discriminated JSON frames.
//!
//! The source generates `type` from a generic class argument via a
//! metaclass-style validator; here each variant simply hard-codes its own
//! literal tag through serde's internally-tagged enum representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ResponsesLength;

fn new_event_id() -> String {
    format!("event_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Inbound frames accepted from the client (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "response.selected.by.writer")]
    ResponseSelectedByWriter { text: String, id: Uuid },
    #[serde(rename = "current.keywords")]
    CurrentKeywords { keywords: Option<String> },
    #[serde(rename = "desired.responses.length")]
    DesiredResponsesLength { length: ResponsesLength },
}

/// Outbound frames pushed to the client. Every variant carries a
/// server-generated `event_id` (spec.md §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error {
        event_id: String,
        error: ErrorDetails,
    },
    #[serde(rename = "response.created")]
    ResponseCreated {
        event_id: String,
        status: &'static str,
        voice: String,
    },
    #[serde(rename = "one.keyword")]
    OneKeyword {
        event_id: String,
        content: String,
        timestamp: DateTime<Utc>,
        index: usize,
    },
    #[serde(rename = "one.response")]
    OneResponse {
        event_id: String,
        content: String,
        timestamp: DateTime<Utc>,
        index: usize,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        event_id: String,
        delta: String,
        start_time: f64,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted { event_id: String },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped { event_id: String },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        event_id: String,
        delta: String,
        response_id: Uuid,
    },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone { event_id: String },
    #[serde(rename = "unmute.interrupted_by_vad")]
    InterruptedByVad { event_id: String },
}

impl ServerEvent {
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            event_id: new_event_id(),
            error: ErrorDetails {
                kind: kind.to_string(),
                code: None,
                message: message.into(),
                param: None,
                details: None,
            },
        }
    }

    pub fn error_with_details(kind: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        ServerEvent::Error {
            event_id: new_event_id(),
            error: ErrorDetails {
                kind: kind.to_string(),
                code: None,
                message: message.into(),
                param: None,
                details: Some(details),
            },
        }
    }

    pub fn response_created(voice: impl Into<String>) -> Self {
        ServerEvent::ResponseCreated {
            event_id: new_event_id(),
            status: "in_progress",
            voice: voice.into(),
        }
    }

    pub fn one_keyword(content: impl Into<String>, timestamp: DateTime<Utc>, index: usize) -> Self {
        ServerEvent::OneKeyword {
            event_id: new_event_id(),
            content: content.into(),
            timestamp,
            index,
        }
    }

    pub fn one_response(content: impl Into<String>, timestamp: DateTime<Utc>, index: usize) -> Self {
        ServerEvent::OneResponse {
            event_id: new_event_id(),
            content: content.into(),
            timestamp,
            index,
        }
    }

    pub fn transcription_delta(delta: impl Into<String>, start_time: f64) -> Self {
        ServerEvent::TranscriptionDelta {
            event_id: new_event_id(),
            delta: delta.into(),
            start_time,
        }
    }

    pub fn speech_started() -> Self {
        ServerEvent::SpeechStarted { event_id: new_event_id() }
    }

    pub fn speech_stopped() -> Self {
        ServerEvent::SpeechStopped { event_id: new_event_id() }
    }

    pub fn response_audio_delta(delta: impl Into<String>, response_id: Uuid) -> Self {
        ServerEvent::ResponseAudioDelta {
            event_id: new_event_id(),
            delta: delta.into(),
            response_id,
        }
    }

    pub fn response_audio_done() -> Self {
        ServerEvent::ResponseAudioDone { event_id: new_event_id() }
    }

    pub fn interrupted_by_vad() -> Self {
        ServerEvent::InterruptedByVad { event_id: new_event_id() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_append_event() {
        let raw = r#"{"type":"input_audio_buffer.append","audio":"AAAA"}"#;
        let ev: ClientEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(ev, ClientEvent::InputAudioBufferAppend { audio } if audio == "AAAA"));
    }

    #[test]
    fn rejects_missing_audio_field() {
        let raw = r#"{"type":"input_audio_buffer.append"}"#;
        let result: Result<ClientEvent, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn serializes_tagged_discriminator() {
        let ev = ServerEvent::speech_started();
        let v: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "input_audio_buffer.speech_started");
    }
}
