//! Speech-to-text client: connects to one STT instance over WebSocket,
//! speaks either the Gradium or Kyutai wire variant, and surfaces a
//! protocol-agnostic stream of words/markers plus a live pause estimate
//! (spec.md §4.3). Grounded in
//! `examples/original_source/.../stt/speech_to_text.py`.
//!
//! The websocket is split into a send half and a receive half right after
//! the handshake (`into_handles`): the turn controller pushes audio from the
//! client-gateway's receive loop while a separate quest drains server
//! frames, and both sides need to read the live pause estimate and time
//! position. A `std::sync::Mutex`-guarded `Telemetry` is shared between them
//! instead of serializing the two halves behind one lock, since holding a
//! lock across the receive half's `.next().await` would starve the sender
//! for as long as the server has nothing new to say.

pub mod ema;
pub mod gradium;
pub mod kyutai;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::broker::StartUp;
use crate::error::OrchestratorError;
use crate::metrics;
use ema::{ExponentialMovingAverage, PAUSE_THRESHOLD, WARMUP_STEPS};

/// Two generations of STT servers speak incompatible wire protocols over
/// the same conceptual session (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttProtocol {
    Gradium,
    Kyutai,
}

/// Normalized STT output, independent of wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    Word { text: String, start_time: f64 },
    Marker { id: u64 },
}

pub const SAMPLE_RATE: u32 = 24_000;
pub const FRAME_TIME_SEC: f64 = 0.08;
pub const STT_DELAY_SEC: f64 = 2.0;
const GRADIUM_CHUNK_SAMPLES: usize = 1_920;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

struct TelemetryInner {
    sent_samples: u64,
    current_time: f64,
    pause_prediction: ExponentialMovingAverage,
    steps_remaining_in_warmup: u32,
}

/// Pause estimate, stream time position, and sample count, shared between
/// the sender and receiver halves of a connected STT session.
pub struct SttTelemetry {
    inner: Mutex<TelemetryInner>,
}

impl SttTelemetry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TelemetryInner {
                sent_samples: 0,
                current_time: -STT_DELAY_SEC,
                pause_prediction: ExponentialMovingAverage::new(0.01, 0.01, 1.0),
                steps_remaining_in_warmup: WARMUP_STEPS,
            }),
        })
    }

    pub fn current_time(&self) -> f64 {
        self.inner.lock().expect("telemetry mutex poisoned").current_time
    }

    pub fn pause_estimate(&self) -> f64 {
        self.inner.lock().expect("telemetry mutex poisoned").pause_prediction.value()
    }

    pub fn is_paused(&self) -> bool {
        self.pause_estimate() > PAUSE_THRESHOLD
    }

    pub fn sent_samples(&self) -> u64 {
        self.inner.lock().expect("telemetry mutex poisoned").sent_samples
    }

    /// Reset the pause estimate to "actively speaking", done when a new
    /// user message starts (spec.md §4.6 pause-detection reset).
    pub fn reset_pause(&self) {
        let mut inner = self.inner.lock().expect("telemetry mutex poisoned");
        inner.pause_prediction = ExponentialMovingAverage::new(0.01, 0.01, 0.0);
    }

    fn record_sent(&self, samples: usize) {
        self.inner.lock().expect("telemetry mutex poisoned").sent_samples += samples as u64;
    }

    fn note_step(&self) -> bool {
        let mut inner = self.inner.lock().expect("telemetry mutex poisoned");
        inner.current_time += FRAME_TIME_SEC;
        if inner.steps_remaining_in_warmup > 0 {
            inner.steps_remaining_in_warmup -= 1;
            false
        } else {
            true
        }
    }

    fn update_pause(&self, new_value: f64) {
        self.inner
            .lock()
            .expect("telemetry mutex poisoned")
            .pause_prediction
            .update(FRAME_TIME_SEC, new_value);
    }
}

/// A not-yet-connected STT client. Implements `StartUp` so the broker can
/// drive the handshake; on success, split into a sender and a receiver with
/// `into_handles`.
pub struct SttClient {
    protocol: SttProtocol,
    instance_url: String,
    websocket: Option<WsStream>,
}

impl SttClient {
    pub fn new(protocol: SttProtocol, instance_url: impl Into<String>) -> Self {
        Self {
            protocol,
            instance_url: instance_url.into(),
            websocket: None,
        }
    }

    async fn connect(&self, header_name: &str, header_value: &str) -> Result<WsStream, OrchestratorError> {
        let mut request = self
            .instance_url
            .as_str()
            .into_client_request()
            .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("bad STT URL: {e}")))?;
        let name = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("bad header name: {e}")))?;
        request.headers_mut().insert(
            name,
            HeaderValue::from_str(header_value)
                .map_err(|e| OrchestratorError::Internal(anyhow::anyhow!("bad header value: {e}")))?,
        );
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| OrchestratorError::UpstreamTransportLoss { service: format!("stt: {e}") })?;
        Ok(stream)
    }

    /// Split a handshaken client into independent send/receive halves
    /// sharing one telemetry handle.
    pub fn into_handles(mut self) -> (SttSender, SttReceiver, Arc<SttTelemetry>) {
        let ws = self.websocket.take().expect("into_handles called before a successful start_up");
        let (sink, stream) = ws.split();
        let telemetry = SttTelemetry::new();
        (
            SttSender { protocol: self.protocol, sink, telemetry: telemetry.clone() },
            SttReceiver {
                protocol: self.protocol,
                stream,
                telemetry: telemetry.clone(),
                received_words: 0,
                audio_started: false,
                session_start: None,
                first_step_seen: false,
            },
            telemetry,
        )
    }
}

#[async_trait]
impl StartUp for SttClient {
    async fn start_up(&mut self) -> Result<(), OrchestratorError> {
        match self.protocol {
            SttProtocol::Gradium => {
                let api_key = std::env::var("GRADIUM_API_KEY").map_err(|_| {
                    OrchestratorError::Internal(anyhow::anyhow!("GRADIUM_API_KEY is required"))
                })?;
                info!(instance = %self.instance_url, "connecting to Gradium STT");
                let mut ws = self.connect("x-api-key", &api_key).await?;

                let setup = gradium::GradiumClientMessage::setup();
                let json = serde_json::to_string(&setup).map_err(|e| OrchestratorError::Internal(e.into()))?;
                ws.send(WsMessage::Text(json.into()))
                    .await
                    .map_err(|e| OrchestratorError::UpstreamTransportLoss { service: format!("stt: {e}") })?;

                let reply = ws
                    .next()
                    .await
                    .ok_or_else(|| OrchestratorError::UpstreamTransportLoss { service: "stt".to_string() })?
                    .map_err(|e| OrchestratorError::UpstreamTransportLoss { service: format!("stt: {e}") })?;
                let WsMessage::Text(text) = reply else {
                    return Err(OrchestratorError::Protocol("expected text reply from Gradium STT".to_string()));
                };
                match gradium::parse_server_message(&text) {
                    Some(gradium::GradiumServerMessage::Ready { .. }) => {
                        metrics::STT_ACTIVE_SESSIONS.inc();
                        self.websocket = Some(ws);
                        Ok(())
                    }
                    Some(gradium::GradiumServerMessage::Error { message, .. }) => {
                        Err(OrchestratorError::UpstreamAtCapacity { service: format!("stt: {message}") })
                    }
                    _ => Err(OrchestratorError::Protocol("unexpected Gradium STT handshake reply".to_string())),
                }
            }
            SttProtocol::Kyutai => {
                info!(instance = %self.instance_url, "connecting to Kyutai STT");
                let mut ws = self.connect("kyutai-api-key", "public_token").await?;

                let reply = ws
                    .next()
                    .await
                    .ok_or_else(|| OrchestratorError::UpstreamTransportLoss { service: "stt".to_string() })?
                    .map_err(|e| OrchestratorError::UpstreamTransportLoss { service: format!("stt: {e}") })?;
                let WsMessage::Binary(bytes) = reply else {
                    return Err(OrchestratorError::Protocol("expected binary reply from Kyutai STT".to_string()));
                };
                match kyutai::decode_server_message(&bytes) {
                    Ok(kyutai::KyutaiServerMessage::Ready) => {
                        metrics::STT_ACTIVE_SESSIONS.inc();
                        self.websocket = Some(ws);
                        Ok(())
                    }
                    Ok(kyutai::KyutaiServerMessage::Error { .. }) => {
                        Err(OrchestratorError::UpstreamAtCapacity { service: "stt".to_string() })
                    }
                    _ => Err(OrchestratorError::Protocol("unexpected Kyutai STT handshake reply".to_string())),
                }
            }
        }
    }
}

/// The write half: pushes audio/markers. Owned by the client-gateway's
/// receive loop.
pub struct SttSender {
    protocol: SttProtocol,
    sink: WsSink,
    telemetry: Arc<SttTelemetry>,
}

impl SttSender {
    /// Push a chunk of f32 PCM audio to the STT server.
    pub async fn send_audio(&mut self, pcm: &[f32]) -> Result<(), OrchestratorError> {
        self.telemetry.record_sent(pcm.len());
        metrics::STT_SENT_FRAMES.inc();

        match self.protocol {
            SttProtocol::Gradium => {
                // Gradium recommends 1920-sample chunks; paced with a small
                // sleep between sends so we don't overwhelm the service.
                for chunk in pcm.chunks(GRADIUM_CHUNK_SAMPLES) {
                    let msg = gradium::GradiumClientMessage::audio(chunk);
                    let json = serde_json::to_string(&msg)
                        .map_err(|e| OrchestratorError::Internal(e.into()))?;
                    self.sink
                        .send(WsMessage::Text(json.into()))
                        .await
                        .map_err(|e| OrchestratorError::UpstreamTransportLoss { service: format!("stt: {e}") })?;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
            SttProtocol::Kyutai => {
                let msg = kyutai::KyutaiClientMessage::Audio { pcm: pcm.to_vec() };
                let bytes = msg.encode().map_err(|e| OrchestratorError::Internal(e.into()))?;
                self.sink
                    .send(WsMessage::Binary(bytes.into()))
                    .await
                    .map_err(|e| OrchestratorError::UpstreamTransportLoss { service: format!("stt: {e}") })?;
            }
        }
        Ok(())
    }

    /// Send `count` frames of silence, used to flush the STT's processing
    /// delay after a detected pause (spec.md §4.6).
    pub async fn send_silence_frames(&mut self, count: usize, samples_per_frame: usize) -> Result<(), OrchestratorError> {
        let zeros = vec![0.0_f32; samples_per_frame];
        for _ in 0..count {
            self.send_audio(&zeros).await?;
        }
        Ok(())
    }

    /// Send a marker (Kyutai only; Gradium has no marker concept and the
    /// call is a silent no-op for compatibility, per the source).
    pub async fn send_marker(&mut self, id: u64) -> Result<(), OrchestratorError> {
        match self.protocol {
            SttProtocol::Gradium => {
                debug!(id, "Gradium STT has no marker support, ignoring");
                Ok(())
            }
            SttProtocol::Kyutai => {
                let msg = kyutai::KyutaiClientMessage::Marker { id };
                let bytes = msg.encode().map_err(|e| OrchestratorError::Internal(e.into()))?;
                self.sink
                    .send(WsMessage::Binary(bytes.into()))
                    .await
                    .map_err(|e| OrchestratorError::UpstreamTransportLoss { service: format!("stt: {e}") })
            }
        }
    }
}

/// The read half: drains server messages into normalized events. Driven by
/// a dedicated quest task.
pub struct SttReceiver {
    protocol: SttProtocol,
    stream: SplitStream<WsStream>,
    telemetry: Arc<SttTelemetry>,
    received_words: u64,
    audio_started: bool,
    session_start: Option<std::time::Instant>,
    first_step_seen: bool,
}

impl SttReceiver {
    /// Drain server messages into normalized events, updating the pause
    /// estimate and metrics as steps arrive. Runs until the connection
    /// closes or an `end_of_stream`/error frame is seen.
    pub async fn run(mut self, out: mpsc::Sender<SttEvent>) {
        while let Some(frame) = self.stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "STT connection closed with error");
                    break;
                }
            };
            match frame {
                WsMessage::Text(text) => {
                    let Some(parsed) = gradium::parse_server_message(&text) else { continue };
                    if self.handle_gradium(parsed, &out).await {
                        break;
                    }
                }
                WsMessage::Binary(bytes) => {
                    let Ok(parsed) = kyutai::decode_server_message(&bytes) else { continue };
                    if self.handle_kyutai(parsed, &out).await {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        metrics::STT_ACTIVE_SESSIONS.dec();
        if let Some(start) = self.session_start {
            let elapsed = start.elapsed().as_secs_f64();
            metrics::STT_SESSION_DURATION.observe(elapsed);
            metrics::STT_AUDIO_DURATION.observe(self.telemetry.sent_samples() as f64 / SAMPLE_RATE as f64);
            metrics::STT_NUM_WORDS.observe(self.received_words as f64);
        }
    }

    /// Returns true if the stream should stop after this message.
    async fn handle_gradium(&mut self, message: gradium::GradiumServerMessage, out: &mpsc::Sender<SttEvent>) -> bool {
        use gradium::GradiumServerMessage as M;
        match message {
            M::Text { text, start_s } => {
                self.note_words(&text);
                let _ = out.send(SttEvent::Word { text, start_time: start_s }).await;
                false
            }
            M::EndText { .. } => false,
            M::Step { vad, .. } => {
                metrics::STT_RECV_FRAMES.inc();
                self.note_step();
                if self.telemetry.note_step() && vad.len() >= 3 {
                    let inactivity_prob = vad.last().expect("len >= 3").inactivity_prob;
                    self.telemetry.update_pause(1.0 - inactivity_prob);
                }
                false
            }
            M::EndOfStream => {
                info!("STT end_of_stream received");
                true
            }
            M::Error { message, code } => {
                error!(message, code, "Gradium STT error");
                true
            }
            M::Ready { .. } => false,
        }
    }

    async fn handle_kyutai(&mut self, message: kyutai::KyutaiServerMessage, out: &mpsc::Sender<SttEvent>) -> bool {
        use kyutai::KyutaiServerMessage as M;
        match message {
            M::Word { text, start_time } => {
                self.note_words(&text);
                let _ = out.send(SttEvent::Word { text, start_time }).await;
                false
            }
            M::EndWord { .. } => false,
            M::Marker { id } => {
                let _ = out.send(SttEvent::Marker { id }).await;
                false
            }
            M::Step { prs, .. } => {
                metrics::STT_RECV_FRAMES.inc();
                self.note_step();
                if self.telemetry.note_step() && prs.len() > 2 {
                    self.telemetry.update_pause(prs[2]);
                }
                false
            }
            M::Error { message } => {
                error!(message, "Kyutai STT error");
                true
            }
            M::Ready => false,
        }
    }

    fn note_words(&mut self, text: &str) {
        let n = text.split_whitespace().count() as u64;
        self.received_words += n;
        metrics::STT_RECV_WORDS.inc_by(n as f64);
    }

    fn note_step(&mut self) {
        if !self.audio_started {
            self.audio_started = true;
            self.session_start = Some(std::time::Instant::now());
        }
        if !self.first_step_seen && self.audio_started {
            self.first_step_seen = true;
            if let Some(start) = self.session_start {
                metrics::STT_TTFT.observe(start.elapsed().as_secs_f64());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_paused_state_above_threshold() {
        // Initial pause value is 1.0 (fully "inactive"/paused) per the source.
        let telemetry = SttTelemetry::new();
        assert!(telemetry.is_paused());
    }

    #[test]
    fn warmup_window_matches_ema_constant() {
        let telemetry = SttTelemetry::new();
        assert_eq!(telemetry.inner.lock().unwrap().steps_remaining_in_warmup, WARMUP_STEPS);
    }

    #[test]
    fn reset_pause_clears_to_actively_speaking() {
        let telemetry = SttTelemetry::new();
        telemetry.reset_pause();
        assert!(!telemetry.is_paused());
    }
}
