use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, ChatRole};

/// File attached to the current turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub url: String,
}

/// State threaded through one run and persisted per thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl ConversationState {
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Text of the last assistant message, if the run ended on one.
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == ChatRole::Assistant && m.pending_tool_calls().is_empty())
            .map(|m| m.text())
    }
}

/// What a caller submits for one turn. Messages are appended to the thread
/// history; the attachment replaces whatever the previous turn carried.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnInput {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl TurnInput {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(content)],
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentState {
    On,
    Off,
    Restart,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Restart => "RESTART",
        })
    }
}

/// Read-only status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub status: AgentState,
    pub bm25_last_sync: Option<DateTime<Utc>>,
    pub available_vector_stores: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgressStatus {
    Restarting,
    Restarted,
}

/// One restart progress event. `percentage` is a fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub status: ProgressStatus,
    pub percentage: f32,
}
