//! Gradium STT wire protocol: JSON text frames, audio as base64 PCM16
//! (spec.md §4.3 "Variant A"). Grounded in
//! `examples/original_source/.../stt/speech_to_text.py`'s Gradium branch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum GradiumClientMessage {
    #[serde(rename = "setup")]
    Setup { model_name: String, input_format: String },
    #[serde(rename = "audio")]
    Audio { audio: String },
    #[serde(rename = "end_of_stream")]
    EndOfStream {},
}

impl GradiumClientMessage {
    pub fn setup() -> Self {
        GradiumClientMessage::Setup {
            model_name: "default".to_string(),
            input_format: "pcm".to_string(),
        }
    }

    /// Base64-encode a chunk of f32 PCM as little-endian i16 samples, the
    /// format Gradium expects (`audio_to_base64_pcm`).
    pub fn audio(pcm_f32: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(pcm_f32.len() * 2);
        for sample in pcm_f32 {
            let clamped = (sample * 32767.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            bytes.extend_from_slice(&clamped.to_le_bytes());
        }
        use base64::Engine;
        GradiumClientMessage::Audio {
            audio: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VadPrediction {
    pub horizon_s: f64,
    pub inactivity_prob: f64,
}

/// A parsed Gradium server message. Unlike the client->server direction,
/// the server's `error` message carries no `type` field at all in the
/// source, so it can't join the others in one internally-tagged enum;
/// callers fall back to `ErrorMessage` when no recognized `type` is found.
#[derive(Debug, Clone)]
pub enum GradiumServerMessage {
    Ready { request_id: String, sample_rate: u32 },
    Text { text: String, start_s: f64 },
    Step { vad: Vec<VadPrediction>, step_idx: u64 },
    EndText { stop_s: f64 },
    EndOfStream,
    Error { message: String, code: i64 },
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub fn parse_server_message(raw: &str) -> Option<GradiumServerMessage> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let tagged: Tagged = serde_json::from_value(value.clone()).ok()?;
    match tagged.kind.as_deref() {
        Some("ready") => {
            let request_id = value.get("request_id")?.as_str()?.to_string();
            let sample_rate = value.get("sample_rate")?.as_u64()? as u32;
            Some(GradiumServerMessage::Ready { request_id, sample_rate })
        }
        Some("text") => {
            let text = value.get("text")?.as_str()?.to_string();
            let start_s = value.get("start_s")?.as_f64()?;
            Some(GradiumServerMessage::Text { text, start_s })
        }
        Some("step") => {
            let vad: Vec<VadPrediction> = serde_json::from_value(value.get("vad")?.clone()).ok()?;
            let step_idx = value.get("step_idx")?.as_u64()?;
            Some(GradiumServerMessage::Step { vad, step_idx })
        }
        Some("end_text") => {
            let stop_s = value.get("stop_s")?.as_f64()?;
            Some(GradiumServerMessage::EndText { stop_s })
        }
        Some("end_of_stream") => Some(GradiumServerMessage::EndOfStream),
        Some(_unknown) => None,
        None => {
            let message = value.get("message")?.as_str()?.to_string();
            let code = value.get("code")?.as_i64()?;
            Some(GradiumServerMessage::Error { message, code })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready_message() {
        let raw = r#"{"type":"ready","request_id":"abc","model_name":"m","sample_rate":24000,"frame_size":0.08,"text_stream_names":[]}"#;
        let parsed = parse_server_message(raw).unwrap();
        assert!(matches!(parsed, GradiumServerMessage::Ready { sample_rate: 24000, .. }));
    }

    #[test]
    fn parses_error_without_type_field() {
        let raw = r#"{"message":"overloaded","code":503}"#;
        let parsed = parse_server_message(raw).unwrap();
        assert!(matches!(parsed, GradiumServerMessage::Error { code: 503, .. }));
    }

    #[test]
    fn audio_message_encodes_pcm16_little_endian() {
        let msg = GradiumClientMessage::audio(&[0.0, 1.0, -1.0]);
        if let GradiumClientMessage::Audio { audio } = msg {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD.decode(audio).unwrap();
            assert_eq!(bytes.len(), 6);
            assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
            assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 32767);
        } else {
            panic!("expected Audio variant");
        }
    }
}
