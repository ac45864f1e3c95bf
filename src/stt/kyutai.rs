//! Kyutai STT wire protocol: binary MessagePack frames (spec.md §4.3
//! "Variant B"). Grounded in
//! `examples/original_source/.../stt/speech_to_text.py`'s non-Gradium branch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum KyutaiClientMessage {
    Audio { pcm: Vec<f32> },
    Marker { id: u64 },
}

impl KyutaiClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum KyutaiServerMessage {
    Word { text: String, start_time: f64 },
    EndWord { stop_time: f64 },
    Marker { id: u64 },
    Step { step_idx: u64, prs: Vec<f64> },
    Error { message: String },
    Ready,
}

pub fn decode_server_message(bytes: &[u8]) -> Result<KyutaiServerMessage, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_audio_message_as_nonempty_msgpack() {
        let msg = KyutaiClientMessage::Audio { pcm: vec![0.1, -0.2, 0.3] };
        let encoded = msg.encode().unwrap();
        assert!(!encoded.is_empty());
    }

    #[test]
    fn decodes_word_message() {
        #[derive(Serialize)]
        #[serde(tag = "type")]
        enum Wire {
            Word { text: String, start_time: f64 },
        }
        let encoded = rmp_serde::to_vec_named(&Wire::Word {
            text: "hello".to_string(),
            start_time: 1.5,
        })
        .unwrap();
        let decoded = decode_server_message(&encoded).unwrap();
        assert!(matches!(decoded, KyutaiServerMessage::Word { start_time, .. } if start_time == 1.5));
    }
}
