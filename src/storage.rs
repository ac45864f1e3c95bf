//! Per-user persistence and LLM prompt assembly (spec.md §3, §4.5).
//!
//! Grounded in `examples/original_source/.../storage.py`: one JSON file per
//! user under a configured directory, and a prompt renderer that walks past
//! conversations plus the current one into a single system message.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chrono_humanize::HumanTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Conversation, ConversationMessage, LlmMessage, ResponsesLength, UserSettings};

const BASE_SYSTEM_PROMPT: &str = include_str!("system_prompt.txt");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub user_id: Uuid,
    pub email: String,
    pub hashed_password: String,
    #[serde(default)]
    pub google_sub: Option<String>,
    pub user_settings: UserSettings,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no user data found for email: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl UserData {
    pub fn new(email: impl Into<String>, hashed_password: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: email.into(),
            hashed_password: hashed_password.into(),
            google_sub: None,
            user_settings: UserSettings::default(),
            conversations: Vec::new(),
        }
    }

    pub fn save(&self, users_dir: &Path) -> Result<(), StorageError> {
        let path = user_data_path(users_dir, &self.email);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Render the base instructions, user profile, and conversation history
    /// into the single system message sent with every LLM call.
    ///
    /// `user_text_hint` is the user-supplied keyword guidance (spec.md §4.5
    /// `current.keywords`), appended verbatim so the model must weave those
    /// concepts into every suggestion.
    pub fn to_llm_ready_conversation(
        &self,
        user_text_hint: Option<&str>,
        desired_responses_length: ResponsesLength,
    ) -> Vec<LlmMessage> {
        let mut prompt = String::new();
        prompt.push_str(BASE_SYSTEM_PROMPT);
        prompt.push('\n');
        prompt.push('\n');
        prompt.push_str("## User's name\n");
        prompt.push_str(&format!("The user is {}.\n\n", self.user_settings.name));
        prompt.push_str("## User's prompt\n");
        prompt.push_str(&self.user_settings.prompt);
        prompt.push_str("\n\n");
        prompt.push_str("## User's friends\n");
        prompt.push_str(&format!(
            "The friends of the user are: {:?}\n\n",
            self.user_settings.friends
        ));
        prompt.push_str("## User's documents\n");
        prompt.push_str("The documents are here to get a better understanding of the user\n\n");
        for (i, document) in self.user_settings.documents.iter().enumerate() {
            prompt.push_str(&format!("### Document {} \"{}\"\n", i + 1, document.title));
            prompt.push_str(&document.content);
            prompt.push_str("\n\n");
        }
        prompt.push_str("## Past conversations with dates\n");
        prompt.push_str(
            "The conversations here were done with the software, and are shown to give you context about the user\n\n",
        );

        let last_start_time = self.conversations.last().map(|c| c.start_time);
        for (i, conversation) in self.conversations.iter().enumerate() {
            if conversation.messages.is_empty() {
                continue;
            }
            let is_last = i == self.conversations.len() - 1;
            if is_last {
                prompt.push_str("## Current conversation with the user\n\n");
            } else if let Some(last_start) = last_start_time {
                let readable_datetime = conversation.start_time.format("%A, %B %d, %Y at %H:%M");
                let delta = last_start - conversation.start_time;
                let readable_delta = HumanTime::from(delta);
                prompt.push_str(&format!(
                    "### Conversation of {readable_datetime} ({readable_delta} ago)\n\n"
                ));
            }

            for message in &conversation.messages {
                match message {
                    ConversationMessage::Speaker(m) => {
                        prompt.push_str(&format!("* Speaker: {}\n", m.content.trim()));
                    }
                    ConversationMessage::Writer(m) => {
                        prompt.push_str(&format!(
                            "* {} says: {}\n",
                            self.user_settings.name,
                            m.content.trim()
                        ));
                    }
                }
            }
        }

        prompt.push_str("## Desired responses length\n");
        let (min_words, max_words) = desired_responses_length.word_range();
        prompt.push_str(&format!(
            "Each response should be between {min_words} and {max_words} words long.\n\n"
        ));
        prompt.push_str("## User's keywords sent to you to guide your answers\n\n");
        if let Some(hint) = user_text_hint {
            prompt.push_str("The user chose the following keywords to guide the answers, ");
            prompt.push_str(&format!("use those concept in **all** of your responses: {hint}."));
        }

        vec![LlmMessage { role: "system".to_string(), content: prompt }]
    }
}

fn user_data_path(users_dir: &Path, email: &str) -> PathBuf {
    users_dir.join(format!("{email}.json"))
}

pub fn get_user_data_from_storage(users_dir: &Path, email: &str) -> Result<UserData, StorageError> {
    let path = user_data_path(users_dir, email);
    if !path.exists() {
        return Err(StorageError::NotFound(email.to_string()));
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpeakerMessage;

    #[test]
    fn missing_user_data_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = get_user_data_from_storage(dir.path(), "nobody@example.com").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = UserData::new("person@example.com", "hash");
        data.user_settings.name = "Alex".to_string();
        data.save(dir.path()).unwrap();

        let loaded = get_user_data_from_storage(dir.path(), "person@example.com").unwrap();
        assert_eq!(loaded.user_settings.name, "Alex");
    }

    #[test]
    fn prompt_includes_user_name_and_response_length() {
        let mut data = UserData::new("person@example.com", "hash");
        data.user_settings.name = "Alex".to_string();
        data.conversations.push(Conversation {
            messages: vec![ConversationMessage::Speaker(SpeakerMessage {
                speaker: "friend".to_string(),
                content: "Hello there".to_string(),
            })],
            start_time: Utc::now(),
        });

        let messages = data.to_llm_ready_conversation(Some("coffee"), ResponsesLength::M);
        let prompt = &messages[0].content;
        assert!(prompt.contains("The user is Alex."));
        assert!(prompt.contains("between 5 and 15 words"));
        assert!(prompt.contains("coffee"));
        assert!(prompt.contains("Speaker: Hello there"));
    }
}
