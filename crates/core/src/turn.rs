//! Turn request and result — what a caller hands the engine and gets back.

use serde::{Deserialize, Serialize};
use crate::message::{ConversationKind, MessageState};
use crate::tool::ToolCallRecord;

/// One user query to run through an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    /// Persona name (e.g. "chat").
    pub agent: String,
    /// Owner of the conversation.
    pub user: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Continue an existing conversation; `None` opens a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Regenerate an existing message; its stored inputs and query are replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Initial title for a new conversation.
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub kind: ConversationKind,
    /// "provider/model" override for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TurnRequest {
    pub fn new(agent: impl Into<String>, user: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            user: user.into(),
            query: query.into(),
            inputs: serde_json::Map::new(),
            conversation_id: None,
            message_id: None,
            title: String::new(),
            kind: ConversationKind::Main,
            model: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: ConversationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// The outcome of a completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub conversation_id: String,
    pub message_id: String,
    /// The final round's text.
    pub answer: String,
    pub status: MessageState,
    pub rounds: u32,
    pub tool_calls: Vec<ToolCallRecord>,
}
