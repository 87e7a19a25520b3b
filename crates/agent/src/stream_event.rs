//! Streaming events of a turn.
//!
//! Every event carries the same envelope (`task_id`, `message_id`,
//! `conversation_id`) and an `event` tag naming the payload:
//! - `workflow_started`  — conversation and message are ready
//! - `message`           — partial text from the model
//! - `message_replace`   — replace the last `answer_replace` marker with `answer`
//! - `node_started`      — a tool began running
//! - `node_finished`     — a tool finished
//! - `workflow_finished` — the turn succeeded or was stopped
//! - `error`             — the turn failed; nothing follows

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Same as `message_id`; the id a stop request targets.
    pub task_id: String,
    pub message_id: String,
    pub conversation_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStarted,

    Message { answer: String },

    MessageReplace { answer_replace: String, answer: String },

    NodeStarted { data: NodeData },

    NodeFinished { data: NodeData },

    WorkflowFinished { data: WorkflowData },

    Error { message: String },
}

/// Status of a node or of the whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// The tool name.
    pub node_id: String,
    /// The tool label.
    pub title: String,
    /// Seconds the tool ran; set on `node_finished`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowData {
    pub status: RunStatus,
}

impl EventPayload {
    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::Message { .. } => "message",
            Self::MessageReplace { .. } => "message_replace",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeFinished { .. } => "node_finished",
            Self::WorkflowFinished { .. } => "workflow_finished",
            Self::Error { .. } => "error",
        }
    }

    /// Whether nothing follows this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowFinished { .. } | Self::Error { .. })
    }
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
