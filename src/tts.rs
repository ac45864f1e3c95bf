//! Text-to-speech client: requests streamed PCM audio for a selected
//! response, for the client gateway to Opus-encode and forward (spec.md
//! §4.1, §6). The one-shot `/v1/speak` proxy used by the HTTP surface
//! (`server::http::tts_handler`) is a separate, simpler interface for
//! clients that want a whole file; this one streams.

use reqwest::{Client, Response};

use crate::error::OrchestratorError;

pub struct TtsClient {
    http: Client,
    base_url: String,
}

impl TtsClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    /// Request synthesized speech as a stream of raw PCM float32 LE bytes,
    /// mono, at `stt::SAMPLE_RATE`.
    pub async fn stream_speech(&self, text: &str, voice: &str) -> Result<Response, OrchestratorError> {
        let response = self
            .http
            .post(format!("{}/v1/speak/stream", self.base_url))
            .json(&serde_json::json!({
                "text": text,
                "voice": voice,
                "format": "pcm_f32le",
                "sample_rate": crate::stt::SAMPLE_RATE,
            }))
            .send()
            .await
            .map_err(|_| OrchestratorError::UpstreamTransportLoss { service: "tts".to_string() })?;

        response
            .error_for_status()
            .map_err(|_| OrchestratorError::UpstreamTransportLoss { service: "tts".to_string() })
    }
}
