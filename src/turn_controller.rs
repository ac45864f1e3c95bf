//! Turn Controller: pause detection, flush, and response-generation
//! sequencing for one session (spec.md §4.6).
//!
//! Grounded in `examples/original_source/.../unmute_handler.py`: audio
//! frames are forwarded to the STT as they arrive; once the STT's smoothed
//! pause estimate crosses threshold, a fixed amount of silence is flushed
//! through the STT (covering its internal processing delay) before
//! generation starts, so the last few words aren't lost. A bare `"llm"`
//! quest name is used for the streaming generation (a deliberate departure
//! from the source's timestamp-suffixed quest name, recorded in DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::events::ServerEvent;
use crate::llm::partial_json::Completed;
use crate::llm::{ChatMessage, LlmClient};
use crate::metrics;
use crate::quest::{Quest, QuestManager};
use crate::storage::UserData;
use crate::stt::ema::PAUSE_THRESHOLD;
use crate::stt::{SttEvent, SttReceiver, SttSender, SttTelemetry, FRAME_TIME_SEC, SAMPLE_RATE, STT_DELAY_SEC};
use crate::types::{Conversation, ConversationState, ResponsesLength};

/// Sampling temperature for a session's very first generation; every
/// subsequent one uses `FURTHER_MESSAGES_TEMPERATURE` (spec.md §4.6).
const FIRST_MESSAGE_TEMPERATURE: f32 = 0.7;
const FURTHER_MESSAGES_TEMPERATURE: f32 = 0.3;

/// New user speech arriving while the bot is speaking is ignored as an
/// interruption trigger for this long after generation starts, so a stray
/// noise right as the bot begins talking can't cut it off (spec.md §4.6,
/// enforced in `handle_stt_event` before calling `interrupt_bot`).
pub const UNINTERRUPTIBLE_BY_VAD_TIME_SEC: f64 = 3.0;

/// An implicit "user long silence" budget: it gates soft behaviors (here,
/// dropping a stale keyword hint) and never terminates the session
/// (spec.md §5 "Timeouts").
pub const USER_SILENCE_TIMEOUT: f64 = 7.0;

struct TurnState {
    user_data: UserData,
    /// Explicit override of the derived conversation state, set while a
    /// generation is in flight and cleared once the user starts a new
    /// message (spec.md §3's note that `bot_speaking`/`waiting_for_user`
    /// aren't always derivable from the tail message alone).
    override_state: Option<ConversationState>,
    current_keywords: Option<String>,
    desired_responses_length: ResponsesLength,
    stt_end_of_flush_time: Option<f64>,
    /// Wall-clock instant the bot started speaking, for
    /// `UNINTERRUPTIBLE_BY_VAD_TIME_SEC`.
    bot_speaking_since: Option<std::time::Instant>,
    /// Wall-clock instant the session last entered `waiting_for_user`, for
    /// `USER_SILENCE_TIMEOUT`.
    waiting_since: Option<std::time::Instant>,
}

impl TurnState {
    fn current_conversation_mut(&mut self) -> &mut Conversation {
        self.user_data
            .conversations
            .last_mut()
            .expect("a current conversation is always present")
    }

    fn conversation_state(&self) -> ConversationState {
        self.override_state.unwrap_or_else(|| {
            self.user_data
                .conversations
                .last()
                .map(Conversation::conversation_state)
                .unwrap_or(ConversationState::WaitingForUser)
        })
    }
}

/// Orchestrates one session's turn-taking: STT ingestion, pause/flush
/// sequencing, and LLM generation, all routed through the session's
/// `QuestManager` and output queue.
pub struct TurnController {
    quests: Arc<QuestManager>,
    output_tx: mpsc::Sender<ServerEvent>,
    llm: Arc<LlmClient>,
    voice: String,
    state: Mutex<TurnState>,
    stt_sender: Mutex<Option<SttSender>>,
    stt_telemetry: Mutex<Option<Arc<SttTelemetry>>>,
    generation_count: AtomicU64,
}

impl TurnController {
    pub fn new(
        quests: Arc<QuestManager>,
        output_tx: mpsc::Sender<ServerEvent>,
        llm: Arc<LlmClient>,
        voice: impl Into<String>,
        mut user_data: UserData,
        desired_responses_length: ResponsesLength,
    ) -> Arc<Self> {
        if user_data.conversations.is_empty() {
            user_data.conversations.push(Conversation::new(Utc::now()));
        }
        Arc::new(Self {
            quests,
            output_tx,
            llm,
            voice: voice.into(),
            state: Mutex::new(TurnState {
                user_data,
                override_state: None,
                current_keywords: None,
                desired_responses_length,
                stt_end_of_flush_time: None,
                bot_speaking_since: None,
                waiting_since: Some(std::time::Instant::now()),
            }),
            stt_sender: Mutex::new(None),
            stt_telemetry: Mutex::new(None),
            generation_count: AtomicU64::new(0),
        })
    }

    /// Register the `"stt"` quest and wait for it to finish starting up
    /// before returning, so audio arriving right after session setup is
    /// never dropped on the floor.
    pub async fn start_up_stt(self: &Arc<Self>, sender: SttSender, receiver: SttReceiver, telemetry: Arc<SttTelemetry>) {
        *self.stt_sender.lock().await = Some(sender);
        *self.stt_telemetry.lock().await = Some(telemetry);

        let me = self.clone();
        let handle = tokio::spawn(async move { me.run_stt_ingest(receiver).await });
        self.quests.add(Quest::new("stt", handle, None)).await;
    }

    async fn run_stt_ingest(self: Arc<Self>, receiver: SttReceiver) -> Result<(), OrchestratorError> {
        let (tx, mut rx) = mpsc::channel(256);
        let recv_task = tokio::spawn(receiver.run(tx));
        while let Some(event) = rx.recv().await {
            self.handle_stt_event(event).await;
        }
        recv_task.await.map_err(|e| OrchestratorError::Internal(e.into()))?;
        Ok(())
    }

    async fn handle_stt_event(self: &Arc<Self>, event: SttEvent) {
        match event {
            SttEvent::Marker { .. } => {}
            SttEvent::Word { text, start_time } => {
                let _ = self
                    .output_tx
                    .send(ServerEvent::transcription_delta(text.clone(), start_time))
                    .await;
                if text.is_empty() {
                    return;
                }

                let was_bot_speaking = self.state.lock().await.conversation_state() == ConversationState::BotSpeaking;

                let is_new_message = {
                    let mut state = self.state.lock().await;
                    state.current_conversation_mut().add_user_delta("user", &text)
                };

                if is_new_message {
                    if was_bot_speaking {
                        let past_grace_window = {
                            let state = self.state.lock().await;
                            state
                                .bot_speaking_since
                                .map(|since| since.elapsed().as_secs_f64() >= UNINTERRUPTIBLE_BY_VAD_TIME_SEC)
                                .unwrap_or(true)
                        };
                        if past_grace_window {
                            self.interrupt_bot().await;
                        }
                    }
                    if let Some(telemetry) = self.stt_telemetry.lock().await.as_ref() {
                        telemetry.reset_pause();
                    }
                    let _ = self.output_tx.send(ServerEvent::speech_started()).await;
                    self.state.lock().await.override_state = None;
                }
            }
        }
    }

    /// Forward one audio frame to the STT, then run the pause/flush state
    /// machine: on a newly-detected pause, announce it and flush the STT's
    /// fixed processing delay with silence; once that flush window elapses,
    /// trigger generation (spec.md §4.6).
    pub async fn receive_audio(self: &Arc<Self>, pcm: &[f32]) -> Result<(), OrchestratorError> {
        {
            let mut sender = self.stt_sender.lock().await;
            if let Some(sender) = sender.as_mut() {
                sender.send_audio(pcm).await?;
            }
        }

        let telemetry = self.stt_telemetry.lock().await.clone();
        let Some(telemetry) = telemetry else { return Ok(()) };

        let flush_until = self.state.lock().await.stt_end_of_flush_time;
        match flush_until {
            None => {
                let is_paused = {
                    let state = self.state.lock().await;
                    state.conversation_state() == ConversationState::UserSpeaking
                        && telemetry.pause_estimate() > PAUSE_THRESHOLD
                };
                if is_paused {
                    let _ = self.output_tx.send(ServerEvent::speech_stopped()).await;
                    let deadline = telemetry.current_time() + STT_DELAY_SEC;
                    self.state.lock().await.stt_end_of_flush_time = Some(deadline);

                    let frame_count = (STT_DELAY_SEC / FRAME_TIME_SEC).ceil() as usize + 1;
                    let samples_per_frame = (FRAME_TIME_SEC * SAMPLE_RATE as f64).round() as usize;
                    let mut sender = self.stt_sender.lock().await;
                    if let Some(sender) = sender.as_mut() {
                        sender.send_silence_frames(frame_count, samples_per_frame).await?;
                    }
                }
            }
            Some(deadline) => {
                if telemetry.current_time() > deadline {
                    self.state.lock().await.stt_end_of_flush_time = None;
                    self.generate_response().await;
                }
            }
        }
        Ok(())
    }

    /// Record the user's keyword hint for the next generation (spec.md §6
    /// `current.keywords`).
    pub async fn set_current_keywords(&self, keywords: Option<String>) {
        self.state.lock().await.current_keywords = keywords;
    }

    pub async fn set_desired_responses_length(&self, length: ResponsesLength) {
        self.state.lock().await.desired_responses_length = length;
    }

    /// Register (replacing any in-flight one) the `"llm"` quest that runs
    /// the actual generation.
    pub async fn generate_response(self: &Arc<Self>) {
        let me = self.clone();
        let handle = tokio::spawn(async move { me.generate_response_task().await });
        self.quests.add(Quest::new("llm", handle, None)).await;
    }

    async fn generate_response_task(self: Arc<Self>) -> Result<(), OrchestratorError> {
        let _ = self.output_tx.send(ServerEvent::response_created(self.voice.clone())).await;

        let (chat_messages, temperature) = {
            let mut state = self.state.lock().await;
            let hint = state.current_keywords.clone();
            let responses_length = state.desired_responses_length;
            let rendered = state.user_data.to_llm_ready_conversation(hint.as_deref(), responses_length);

            state.override_state = Some(ConversationState::BotSpeaking);
            state.bot_speaking_since = Some(std::time::Instant::now());
            state.waiting_since = None;
            state.current_conversation_mut().start_writer_message(Uuid::new_v4());

            let generation_i = self.generation_count.fetch_add(1, Ordering::SeqCst);
            let temperature = if generation_i == 0 {
                FIRST_MESSAGE_TEMPERATURE
            } else {
                FURTHER_MESSAGES_TEMPERATURE
            };
            let messages: Vec<ChatMessage> = rendered
                .into_iter()
                .map(|m| ChatMessage { role: m.role, content: m.content })
                .collect();
            (messages, temperature)
        };

        metrics::VLLM_SESSIONS.inc();
        metrics::VLLM_ACTIVE_SESSIONS.inc();
        let request_words: usize = chat_messages.iter().map(|m| m.content.split_whitespace().count()).sum();
        metrics::VLLM_REQUEST_LENGTH.observe(request_words as f64);
        metrics::VLLM_SENT_WORDS.inc_by(request_words as f64);

        let started = std::time::Instant::now();
        let mut first_token = true;
        let mut keyword_index = 0usize;
        let mut answer_index = 0usize;
        let mut reply_words = 0u64;

        let outcome = self
            .llm
            .stream_structured(chat_messages, temperature, |completed| {
                if first_token {
                    first_token = false;
                    metrics::VLLM_TTFT.observe(started.elapsed().as_secs_f64());
                }
                match completed {
                    Completed::Keyword(text) => {
                        let idx = keyword_index;
                        keyword_index += 1;
                        let _ = self.output_tx.try_send(ServerEvent::one_keyword(text, Utc::now(), idx));
                    }
                    Completed::Answer(text) => {
                        reply_words += text.split_whitespace().count() as u64;
                        let idx = answer_index;
                        answer_index += 1;
                        let _ = self.output_tx.try_send(ServerEvent::one_response(text, Utc::now(), idx));
                    }
                }
            })
            .await;

        metrics::VLLM_ACTIVE_SESSIONS.dec();
        metrics::VLLM_GEN_DURATION.observe(started.elapsed().as_secs_f64());
        metrics::VLLM_RECV_WORDS.inc_by(reply_words as f64);
        metrics::VLLM_REPLY_LENGTH.observe(reply_words as f64);

        {
            let mut state = self.state.lock().await;
            state.override_state = Some(ConversationState::WaitingForUser);
            state.bot_speaking_since = None;
            state.waiting_since = Some(std::time::Instant::now());
        }

        if let Err(err) = &outcome {
            metrics::VLLM_HARD_ERRORS.inc();
            warn!(error = %err, "LLM generation failed");
        }
        outcome
    }

    /// Interrupt an in-flight bot response: only valid while the bot is
    /// actually speaking. Drops the `"llm"` quest and announces the
    /// interruption. Called automatically from `handle_stt_event` once new
    /// user speech is detected past `UNINTERRUPTIBLE_BY_VAD_TIME_SEC`.
    pub async fn interrupt_bot(&self) -> bool {
        let is_speaking = self.state.lock().await.conversation_state() == ConversationState::BotSpeaking;
        if !is_speaking {
            return false;
        }
        metrics::VLLM_INTERRUPTS.inc();
        self.quests.remove("llm").await;
        {
            let mut state = self.state.lock().await;
            state.override_state = Some(ConversationState::WaitingForUser);
            state.bot_speaking_since = None;
            state.waiting_since = Some(std::time::Instant::now());
        }
        let _ = self.output_tx.send(ServerEvent::interrupted_by_vad()).await;
        true
    }

    pub async fn conversation_state(&self) -> ConversationState {
        self.state.lock().await.conversation_state()
    }

    /// Handle `response.selected.by.writer`: append the chosen answer as a
    /// `WriterMessage` and close the turn (spec.md §4.5 "Selection" — "this
    /// closes the turn; nothing else is done with the text here").
    pub async fn select_response(&self, text: String, id: Uuid) {
        let mut state = self.state.lock().await;
        state.current_conversation_mut().start_writer_message(id);
        if let Some(writer) = state.current_conversation_mut().tail_writer_mut() {
            writer.content = text;
        }
        state.override_state = Some(ConversationState::WaitingForUser);
        state.bot_speaking_since = None;
        state.waiting_since = Some(std::time::Instant::now());
    }

    /// Soft "user long silence" behavior (spec.md §5): if the session has
    /// been waiting for the user past `USER_SILENCE_TIMEOUT`, drop any
    /// stale keyword hint and restart the window. Never closes the
    /// session; the gateway calls this on an idle tick.
    pub async fn enforce_silence_timeout(&self) {
        let mut state = self.state.lock().await;
        if state.conversation_state() != ConversationState::WaitingForUser {
            return;
        }
        let past_timeout = state
            .waiting_since
            .map(|since| since.elapsed().as_secs_f64() >= USER_SILENCE_TIMEOUT)
            .unwrap_or(false);
        if past_timeout {
            state.current_keywords = None;
            state.waiting_since = Some(std::time::Instant::now());
        }
    }

    /// Hand back the accumulated user data for persistence at session end.
    pub async fn into_user_data(self: Arc<Self>) -> UserData {
        // `Arc::try_unwrap` only succeeds once every quest holding a clone
        // has finished; callers invoke this after `QuestManager::shutdown`.
        match Arc::try_unwrap(self) {
            Ok(controller) => controller.state.into_inner().user_data,
            Err(shared) => shared.state.lock().await.user_data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;

    fn test_controller() -> Arc<TurnController> {
        let quests = QuestManager::new();
        let (tx, _rx) = mpsc::channel(16);
        let llm = Arc::new(LlmClient::new(
            reqwest::Client::new(),
            "http://llm.internal",
            "test-key",
            "test-model",
        ));
        let user_data = UserData::new("person@example.com", "hash");
        TurnController::new(quests, tx, llm, "ember", user_data, ResponsesLength::M)
    }

    #[tokio::test]
    async fn starts_waiting_for_user() {
        let controller = test_controller();
        assert_eq!(controller.conversation_state().await, ConversationState::WaitingForUser);
    }

    #[tokio::test]
    async fn word_event_starts_new_message_and_announces_speech() {
        let controller = test_controller();
        controller.handle_stt_event(SttEvent::Word { text: "hello".to_string(), start_time: 0.0 }).await;
        assert_eq!(controller.conversation_state().await, ConversationState::UserSpeaking);
    }

    #[tokio::test]
    async fn empty_word_event_does_not_start_a_message() {
        let controller = test_controller();
        controller.handle_stt_event(SttEvent::Word { text: String::new(), start_time: 0.0 }).await;
        assert_eq!(controller.conversation_state().await, ConversationState::WaitingForUser);
    }

    #[tokio::test]
    async fn interrupt_bot_is_a_no_op_unless_bot_is_speaking() {
        let controller = test_controller();
        assert!(!controller.interrupt_bot().await);
    }

    #[tokio::test]
    async fn interrupt_bot_clears_override_while_speaking() {
        let controller = test_controller();
        controller.state.lock().await.override_state = Some(ConversationState::BotSpeaking);
        assert!(controller.interrupt_bot().await);
        assert_eq!(controller.conversation_state().await, ConversationState::WaitingForUser);
    }

    #[tokio::test]
    async fn new_speech_past_grace_window_interrupts_the_bot() {
        let controller = test_controller();
        {
            let mut state = controller.state.lock().await;
            state.override_state = Some(ConversationState::BotSpeaking);
            state.bot_speaking_since = Some(
                std::time::Instant::now() - std::time::Duration::from_secs_f64(UNINTERRUPTIBLE_BY_VAD_TIME_SEC + 1.0),
            );
        }
        controller.handle_stt_event(SttEvent::Word { text: "wait".to_string(), start_time: 0.0 }).await;
        assert_eq!(controller.conversation_state().await, ConversationState::UserSpeaking);
    }

    #[tokio::test]
    async fn new_speech_within_grace_window_does_not_interrupt_the_quest() {
        let controller = test_controller();
        {
            let mut state = controller.state.lock().await;
            state.override_state = Some(ConversationState::BotSpeaking);
            state.bot_speaking_since = Some(std::time::Instant::now());
        }
        controller.handle_stt_event(SttEvent::Word { text: "wait".to_string(), start_time: 0.0 }).await;
        // The override is still cleared (new speech always starts a fresh
        // message), but no quest removal happens within the grace window.
        assert_eq!(controller.conversation_state().await, ConversationState::UserSpeaking);
        assert!(!controller.quests.contains("llm").await);
    }

    #[tokio::test]
    async fn select_response_appends_writer_message_and_closes_turn() {
        let controller = test_controller();
        controller.state.lock().await.override_state = Some(ConversationState::BotSpeaking);
        let id = Uuid::new_v4();
        controller.select_response("hello there".to_string(), id).await;
        assert_eq!(controller.conversation_state().await, ConversationState::WaitingForUser);
        let mut state = controller.state.lock().await;
        let writer = state.current_conversation_mut().tail_writer_mut().unwrap();
        assert_eq!(writer.content, "hello there");
        assert_eq!(writer.message_id, id);
    }

    #[tokio::test]
    async fn silence_timeout_drops_stale_keyword_hint() {
        let controller = test_controller();
        controller.set_current_keywords(Some("coffee".to_string())).await;
        controller.state.lock().await.waiting_since =
            Some(std::time::Instant::now() - std::time::Duration::from_secs_f64(USER_SILENCE_TIMEOUT + 1.0));
        controller.enforce_silence_timeout().await;
        assert_eq!(controller.state.lock().await.current_keywords, None);
    }
}
