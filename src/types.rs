//! Shared domain types for sessions, conversations and user records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Desired length of a generated answer, driving both prompt wording and
/// streaming caps (`one.response` index bound).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsesLength {
    XS,
    S,
    M,
    L,
    XL,
}

impl ResponsesLength {
    /// (min, max) word count for this length bucket.
    pub fn word_range(&self) -> (u32, u32) {
        match self {
            ResponsesLength::XS => (1, 5),
            ResponsesLength::S => (3, 10),
            ResponsesLength::M => (5, 15),
            ResponsesLength::L => (8, 20),
            ResponsesLength::XL => (12, 25),
        }
    }
}

impl Default for ResponsesLength {
    fn default() -> Self {
        ResponsesLength::M
    }
}

/// Transcribed user audio fused into one entry per speaking turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerMessage {
    pub speaker: String,
    pub content: String,
}

/// LLM/assistant output selected by the writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterMessage {
    pub content: String,
    /// Stable id, used to find the matching synthesized audio file.
    pub message_id: Uuid,
}

/// One message in a conversation: either side of the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConversationMessage {
    Speaker(SpeakerMessage),
    Writer(WriterMessage),
}

/// The session's derived turn-taking state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    WaitingForUser,
    UserSpeaking,
    BotSpeaking,
}

/// An ordered sequence of messages for one sitting with the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<ConversationMessage>,
    pub start_time: DateTime<Utc>,
}

impl Conversation {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            messages: Vec::new(),
            start_time,
        }
    }

    /// Append a user transcript delta, fusing with the tail `SpeakerMessage`
    /// if present. Returns `true` if this delta started a new message
    /// (i.e. the tail was not already a `SpeakerMessage`).
    pub fn add_user_delta(&mut self, speaker: &str, delta: &str) -> bool {
        if let Some(ConversationMessage::Speaker(tail)) = self.messages.last_mut() {
            let needs_space = !tail.content.ends_with(char::is_whitespace)
                && !delta.starts_with(char::is_whitespace)
                && !tail.content.is_empty()
                && !delta.is_empty();
            if needs_space {
                tail.content.push(' ');
            }
            tail.content.push_str(delta);
            false
        } else {
            self.messages.push(ConversationMessage::Speaker(SpeakerMessage {
                speaker: speaker.to_string(),
                content: delta.to_string(),
            }));
            true
        }
    }

    /// Start a new `WriterMessage` for a fresh generation.
    pub fn start_writer_message(&mut self, message_id: Uuid) {
        self.messages.push(ConversationMessage::Writer(WriterMessage {
            content: String::new(),
            message_id,
        }));
    }

    pub fn tail_writer_mut(&mut self) -> Option<&mut WriterMessage> {
        match self.messages.last_mut() {
            Some(ConversationMessage::Writer(w)) => Some(w),
            _ => None,
        }
    }

    /// Derive the conversation state purely from the tail message, per
    /// spec.md §3. Callers apply an explicit `bot_speaking` override while a
    /// generation is in flight; that override is not modeled here.
    pub fn conversation_state(&self) -> ConversationState {
        match self.messages.last() {
            None => ConversationState::WaitingForUser,
            Some(ConversationMessage::Speaker(m)) if m.content.trim().is_empty() => {
                ConversationState::WaitingForUser
            }
            Some(ConversationMessage::Speaker(_)) => ConversationState::UserSpeaking,
            Some(ConversationMessage::Writer(_)) => ConversationState::BotSpeaking,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserSettings {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub additional_keywords: Vec<String>,
    #[serde(default)]
    pub friends: Vec<String>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub thinking_mode: bool,
}

/// Role-tagged message ready to hand to the LLM chat-completions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuses_consecutive_speaker_deltas_with_single_space() {
        let mut conv = Conversation::new(Utc::now());
        conv.add_user_delta("user", "hello");
        conv.add_user_delta("user", " world");
        match conv.messages.last().unwrap() {
            ConversationMessage::Speaker(m) => assert_eq!(m.content, "hello world"),
            _ => panic!("expected speaker message"),
        }
    }

    #[test]
    fn inserts_separator_when_neither_side_has_one() {
        let mut conv = Conversation::new(Utc::now());
        conv.add_user_delta("user", "hello");
        conv.add_user_delta("user", "world");
        match conv.messages.last().unwrap() {
            ConversationMessage::Speaker(m) => assert_eq!(m.content, "hello world"),
            _ => panic!("expected speaker message"),
        }
    }

    #[test]
    fn writer_message_starts_new_entry_per_generation() {
        let mut conv = Conversation::new(Utc::now());
        conv.add_user_delta("user", "hi");
        conv.start_writer_message(Uuid::nil());
        assert_eq!(conv.messages.len(), 2);
        assert!(matches!(conv.conversation_state(), ConversationState::BotSpeaking));
    }

    #[test]
    fn empty_speaker_tail_is_waiting_for_user() {
        let mut conv = Conversation::new(Utc::now());
        conv.add_user_delta("user", "   ");
        assert!(matches!(conv.conversation_state(), ConversationState::WaitingForUser));
    }
}
