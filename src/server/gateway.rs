//! Client Gateway: the inbound realtime WebSocket session (spec.md §4.1,
//! §6). Negotiates the session's subprotocols and `local_time` query
//! parameter, gates acceptance on upstream health, then wires a
//! `TurnController` to a live STT connection and drives the session's
//! receive/send loops until teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::broker::{ServiceAddress, StartUp};
use crate::error::OrchestratorError;
use crate::events::{ClientEvent, ServerEvent};
use crate::framing::{FirstPageGate, OggOpusDecoder, OggOpusEncoder, OpusDecoder, OpusEncoder};
use crate::llm::LlmClient;
use crate::quest::{Quest, QuestManager};
use crate::server::auth::TokenType;
use crate::server::ServerState;
use crate::storage::{get_user_data_from_storage, UserData};
use crate::stt::{SttClient, SttProtocol, SAMPLE_RATE};
use crate::turn_controller::TurnController;
use crate::tts::TtsClient;

/// How often the session's idle tick fires to enforce the soft long-silence
/// behavior (spec.md §5).
const SILENCE_TICK: Duration = Duration::from_secs(1);

/// Not-yet-connected handle around an `LlmClient`, so the Upstream Broker's
/// `find_instance` can resolve the LLM's address the same way it does the
/// STT's, even though the LLM call itself is stateless HTTP rather than a
/// persistent connection (spec.md §4.4).
struct LlmHandshake {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    client: Option<LlmClient>,
}

#[async_trait]
impl StartUp for LlmHandshake {
    async fn start_up(&mut self) -> Result<(), OrchestratorError> {
        self.client = Some(LlmClient::new(self.http.clone(), self.base_url.clone(), self.api_key.clone(), self.model.clone()));
        Ok(())
    }
}

pub async fn voice_gateway_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<ServerState>,
) -> Response {
    let offered = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let offered: Vec<&str> = offered.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();

    if !offered.contains(&"realtime") {
        return (StatusCode::BAD_REQUEST, "missing `realtime` subprotocol").into_response();
    }
    let Some(token) = offered.iter().find_map(|p| p.strip_prefix("Bearer.")).map(str::to_string) else {
        return (StatusCode::UNAUTHORIZED, "missing `Bearer.<token>` subprotocol").into_response();
    };

    let claims = match state.auth.validate_token(&token) {
        Ok(claims) if claims.token_type == TokenType::Access => claims,
        _ => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
    };

    let Some(local_time_raw) = params.get("local_time") else {
        return (StatusCode::BAD_REQUEST, "missing `local_time` query parameter").into_response();
    };
    // `parse_from_rfc3339` rejects a timestamp with no timezone offset,
    // which is exactly what spec.md §6 requires.
    if DateTime::parse_from_rfc3339(local_time_raw).is_err() {
        return (StatusCode::BAD_REQUEST, "`local_time` must be RFC3339 with a timezone offset").into_response();
    }

    let user = match get_user_data_from_storage(&state.config.storage.users_dir, &claims.sub) {
        Ok(user) => user,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    ws.protocols(["realtime"]).on_upgrade(move |socket| run_session(socket, state, user))
}

async fn run_session(socket: WebSocket, state: ServerState, user: UserData) {
    let stt_address = ServiceAddress::internal(&state.config.stt.url)
        .unwrap_or_else(|_| ServiceAddress::Fixed(state.config.stt.url.clone()));
    let llm_address = ServiceAddress::Fixed(state.config.llm.url.clone());

    let health = state.broker.health(&stt_address, &llm_address).await;
    if !health.ok {
        close_fatal(socket, "upstream not available").await;
        return;
    }

    let quests = QuestManager::new();

    let stt_client = match state
        .broker
        .find_instance(
            "stt",
            &stt_address,
            Duration::from_millis(state.config.stt.start_up_timeout_ms),
            state.config.stt.max_trials,
            |url| async move { SttClient::new(SttProtocol::Gradium, url) },
        )
        .await
    {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "failed to connect to an STT instance");
            close_fatal(socket, "stt unavailable").await;
            return;
        }
    };

    let llm_handshake = {
        let http = state.http.clone();
        let api_key = state.config.llm.api_key.clone();
        let model = state.config.llm.model.clone();
        state
            .broker
            .find_instance(
                "llm",
                &llm_address,
                Duration::from_millis(state.config.llm.start_up_timeout_ms),
                state.config.llm.max_trials,
                move |url| {
                    let http = http.clone();
                    let api_key = api_key.clone();
                    let model = model.clone();
                    async move { LlmHandshake { http, base_url: url, api_key, model, client: None } }
                },
            )
            .await
    };

    let llm = match llm_handshake {
        Ok(handshake) => Arc::new(handshake.client.expect("start_up always sets client")),
        Err(err) => {
            warn!(error = %err, "failed to resolve an LLM instance");
            close_fatal(socket, "llm unavailable").await;
            return;
        }
    };

    let mut decoder = match OggOpusDecoder::spawn(SAMPLE_RATE) {
        Ok(decoder) => decoder,
        Err(err) => {
            warn!(error = %err, "failed to start the audio decoder");
            close_fatal(socket, "internal error").await;
            return;
        }
    };

    let voice = state.config.voices.first().cloned().unwrap_or_else(|| "ember".to_string());
    let tts = Arc::new(TtsClient::new(state.http.clone(), state.config.tts.url.clone()));

    let (output_tx, mut output_rx) = mpsc::channel(256);
    let event_tx = output_tx.clone();
    let controller = TurnController::new(quests.clone(), output_tx, llm, voice.clone(), user, Default::default());

    let (sender, receiver, telemetry) = stt_client.into_handles();
    controller.start_up_stt(sender, receiver, telemetry).await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut gate = FirstPageGate::new();
    let mut silence_tick = tokio::time::interval(SILENCE_TICK);

    loop {
        tokio::select! {
            event = output_rx.recv() => {
                match event {
                    Some(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_event(&text, &controller, &mut gate, &mut decoder, &quests, &tts, &voice, &event_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = silence_tick.tick() => {
                controller.enforce_silence_timeout().await;
            }
        }
    }

    quests.shutdown().await;
    let final_user_data = controller.into_user_data().await;
    if let Err(err) = final_user_data.save(&state.config.storage.users_dir) {
        warn!(error = %err, "failed to persist user data at session teardown");
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_event(
    text: &str,
    controller: &Arc<TurnController>,
    gate: &mut FirstPageGate,
    decoder: &mut OggOpusDecoder,
    quests: &Arc<QuestManager>,
    tts: &Arc<TtsClient>,
    voice: &str,
    output_tx: &mpsc::Sender<ServerEvent>,
) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            let _ = output_tx.send(ServerEvent::error("invalid_request_error", err.to_string())).await;
            return;
        }
    };
    let event: ClientEvent = match serde_json::from_value(raw.clone()) {
        Ok(event) => event,
        Err(err) => {
            let _ = output_tx.send(ServerEvent::error_with_details("invalid_request_error", err.to_string(), raw)).await;
            return;
        }
    };

    match event {
        ClientEvent::InputAudioBufferAppend { audio } => {
            let Ok(page) = base64::engine::general_purpose::STANDARD.decode(&audio) else {
                let _ = output_tx.send(ServerEvent::error("invalid_request_error", "audio is not valid base64")).await;
                return;
            };
            if !gate.admit(&page) {
                return;
            }
            let samples = decoder.push(&page);
            if samples.is_empty() {
                return;
            }
            let pcm: Vec<f32> = samples.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
            if let Err(err) = controller.receive_audio(&pcm).await {
                warn!(error = %err, "failed to forward audio to the STT");
            }
        }
        ClientEvent::CurrentKeywords { keywords } => controller.set_current_keywords(keywords).await,
        ClientEvent::DesiredResponsesLength { length } => controller.set_desired_responses_length(length).await,
        ClientEvent::ResponseSelectedByWriter { text, id } => {
            controller.select_response(text.clone(), id).await;
            let handle = tokio::spawn(synthesize_response(tts.clone(), text, voice.to_string(), id, output_tx.clone()));
            quests.add(Quest::new("tts", handle, None)).await;
        }
    }
}

/// Synthesize the selected response's speech and stream it to the client as
/// `response.audio.delta`/`response.audio.done` events (spec.md §4.1).
async fn synthesize_response(
    tts: Arc<TtsClient>,
    text: String,
    voice: String,
    response_id: Uuid,
    output_tx: mpsc::Sender<ServerEvent>,
) -> Result<(), OrchestratorError> {
    let response = tts.stream_speech(&text, &voice).await?;
    let mut encoder =
        OggOpusEncoder::spawn(SAMPLE_RATE).map_err(|e| OrchestratorError::Internal(e.into()))?;
    let mut stream = response.bytes_stream();
    let mut leftover: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| OrchestratorError::UpstreamTransportLoss { service: "tts".to_string() })?;
        leftover.extend_from_slice(&chunk);

        let usable = leftover.len() - leftover.len() % 4;
        if usable == 0 {
            continue;
        }
        let pcm: Vec<f32> = leftover[..usable]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        leftover.drain(..usable);

        for encoded in encoder.push(&pcm) {
            if encoded.is_empty() {
                continue;
            }
            let delta = base64::engine::general_purpose::STANDARD.encode(encoded);
            let _ = output_tx.send(ServerEvent::response_audio_delta(delta, response_id)).await;
        }
    }

    let _ = output_tx.send(ServerEvent::response_audio_done()).await;
    Ok(())
}

async fn close_fatal(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code: 1011, reason: reason.to_string().into() })))
        .await;
}
