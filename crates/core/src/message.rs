//! Message and Conversation domain types.
//!
//! Two families live here: the chat [`Message`] sent to a provider, and the
//! persisted [`ConversationRecord`] / [`MessageRecord`] rows a turn reads and
//! writes through the [`ChatStore`](crate::store::ChatStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a provider conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
}

/// A single chat message sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Generate a fresh record id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Whether a conversation was opened by a user or by an agent on a user's behalf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    #[default]
    Main,
    Sub,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Sub => "sub",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" => Some(Self::Main),
            "sub" => Some(Self::Sub),
            _ => None,
        }
    }
}

/// The busy flag that serializes turns within one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Normal,
    Busy,
    Disabled,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Busy => "busy",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "busy" => Some(Self::Busy),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Lifecycle of a message, shared with the in-memory request context.
///
/// `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    #[default]
    Running,
    Success,
    Failed,
    Stopped,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub kind: ConversationKind,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields for creating a conversation. Created conversations start `busy`
/// because the creating turn holds the lock.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub user_id: String,
    pub title: String,
    pub kind: ConversationKind,
}

/// Partial update of a conversation; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub status: Option<ConversationStatus>,
}

/// A persisted message: one turn's inputs, process log and answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub agent: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub query: String,
    /// Every tool-using round of the turn, result blocks included.
    #[serde(default)]
    pub process: String,
    #[serde(default)]
    pub answer: String,
    pub status: MessageState,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// The text a user sees for this message: process log, a newline, then the answer.
    pub fn full_answer(&self) -> String {
        if self.process.is_empty() {
            return self.answer.clone();
        }
        format!("{}\n{}", self.process, self.answer)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub agent: String,
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub query: String,
}

/// Partial update of a message; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub process: Option<String>,
    pub answer: Option<String>,
    pub status: Option<MessageState>,
}

/// A user's rating of an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Like,
    Dislike,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Dislike => "dislike",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(Self::Like),
            "dislike" => Some(Self::Dislike),
            _ => None,
        }
    }
}

/// One user's feedback on one message. A user has at most one per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub message_id: String,
    pub user_id: String,
    pub rating: Rating,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub message_id: String,
    pub user_id: String,
    pub rating: Rating,
    pub content: Option<String>,
}
