//! Domain events: turn lifecycle notifications on a broadcast bus.
//!
//! Events are published when a turn starts, runs a tool, or ends.
//! Failure notifications subscribe to `TurnFailed`, which is never published
//! for a user-initiated stop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use crate::message::MessageState;

/// Lifecycle events of turns and their tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A turn acquired its conversation and created or resumed its message
    TurnStarted {
        conversation_id: String,
        message_id: String,
        agent: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        message_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A turn reached `success` or `stopped`
    TurnFinished {
        conversation_id: String,
        message_id: String,
        status: MessageState,
        rounds: u32,
        timestamp: DateTime<Utc>,
    },

    /// A turn failed for a reason other than a stop request
    TurnFailed {
        conversation_id: String,
        message_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`DomainEvent`]s.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks a turn.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        // fails only when nobody subscribed
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            message_id: "m1".into(),
            tool_name: "get-project-info-by-id".into(),
            success: true,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "get-project-info-by-id");
                assert!(success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::TurnFailed {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn events_are_tagged_by_type() {
        let stopped = DomainEvent::TurnFinished {
            conversation_id: "c1".into(),
            message_id: "m2".into(),
            status: MessageState::Stopped,
            rounds: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&stopped).unwrap();
        assert_eq!(json["type"], "turn_finished");
        assert_eq!(json["status"], "stopped");
    }
}
