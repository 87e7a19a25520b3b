//! In-memory store — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use agentry_core::error::StoreError;
use agentry_core::memory::{MemoryEntry, MemoryFilter};
use agentry_core::message::{
    ConversationRecord, ConversationStatus, ConversationUpdate, FeedbackRecord, MessageRecord,
    MessageState, MessageUpdate, NewConversation, NewFeedback, NewMessage, new_id,
};
use agentry_core::store::{ChatStore, StoreResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use crate::MonotonicClock;

#[derive(Default)]
struct State {
    conversations: HashMap<String, ConversationRecord>,
    messages: HashMap<String, MessageRecord>,
    memories: Vec<MemoryEntry>,
    /// Keyed by (message, user).
    feedback: HashMap<(String, String), FeedbackRecord>,
}

/// A store that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    clock: Arc<MonotonicClock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_conversation(&self, new: NewConversation) -> StoreResult<ConversationRecord> {
        let record = ConversationRecord {
            id: new_id(),
            user_id: new.user_id,
            title: new.title,
            kind: new.kind,
            status: ConversationStatus::Busy,
            created_at: self.clock.now(),
        };
        self.state
            .write()
            .await
            .conversations
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<ConversationRecord>> {
        Ok(self.state.read().await.conversations.get(id).cloned())
    }

    async fn transition_conversation(
        &self,
        id: &str,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| not_found("conversation", id))?;
        if conversation.status != from {
            return Ok(false);
        }
        conversation.status = to;
        Ok(true)
    }

    async fn update_conversation(&self, id: &str, update: ConversationUpdate) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| not_found("conversation", id))?;
        if let Some(title) = update.title {
            conversation.title = title;
        }
        if let Some(status) = update.status {
            conversation.status = status;
        }
        Ok(())
    }

    async fn create_message(&self, new: NewMessage) -> StoreResult<MessageRecord> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&new.conversation_id) {
            return Err(not_found("conversation", &new.conversation_id));
        }
        let record = MessageRecord {
            id: new_id(),
            conversation_id: new.conversation_id,
            agent: new.agent,
            inputs: new.inputs,
            query: new.query,
            process: String::new(),
            answer: String::new(),
            status: MessageState::Running,
            created_at: self.clock.now(),
        };
        state.messages.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        Ok(self.state.read().await.messages.get(id).cloned())
    }

    async fn update_message(&self, id: &str, update: MessageUpdate) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(id)
            .ok_or_else(|| not_found("message", id))?;
        if let Some(process) = update.process {
            message.process = process;
        }
        if let Some(answer) = update.answer {
            message.answer = answer;
        }
        if let Some(status) = update.status {
            message.status = status;
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MessageRecord>> {
        let state = self.state.read().await;
        let mut messages: Vec<MessageRecord> = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| before.is_none_or(|b| m.created_at < b))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);

        if let Some(limit) = limit
            && messages.len() > limit
        {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    async fn upsert_memory(&self, entry: MemoryEntry) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let existing = state.memories.iter_mut().find(|m| {
            m.signature == entry.signature
                && m.kind == entry.kind
                && m.conversation_id == entry.conversation_id
                && m.message_id == entry.message_id
        });

        match existing {
            Some(m) => {
                m.content = entry.content;
                m.expires_at = entry.expires_at;
                m.updated_at = self.clock.now();
            }
            None => {
                let now = self.clock.now();
                state.memories.push(MemoryEntry {
                    created_at: now,
                    updated_at: now,
                    ..entry
                });
            }
        }
        Ok(())
    }

    async fn list_memories(&self, filter: MemoryFilter) -> StoreResult<Vec<MemoryEntry>> {
        let state = self.state.read().await;
        let mut memories: Vec<MemoryEntry> = state
            .memories
            .iter()
            .filter(|m| {
                m.conversation_id == filter.conversation_id
                    && m.kind == filter.kind
                    && m.created_at < filter.created_before
                    && m.is_valid_at(filter.valid_at)
            })
            .cloned()
            .collect();
        memories.sort_by_key(|m| m.created_at);
        Ok(memories)
    }

    async fn upsert_feedback(&self, feedback: NewFeedback) -> StoreResult<FeedbackRecord> {
        let mut state = self.state.write().await;
        if !state.messages.contains_key(&feedback.message_id) {
            return Err(not_found("message", &feedback.message_id));
        }
        let record = FeedbackRecord {
            message_id: feedback.message_id,
            user_id: feedback.user_id,
            rating: feedback.rating,
            content: feedback.content,
            updated_at: self.clock.now(),
        };
        state
            .feedback
            .insert((record.message_id.clone(), record.user_id.clone()), record.clone());
        Ok(record)
    }

    async fn delete_feedback(&self, message_id: &str, user_id: &str) -> StoreResult<()> {
        self.state
            .write()
            .await
            .feedback
            .remove(&(message_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn get_feedback(&self, message_id: &str, user_id: &str) -> StoreResult<Option<FeedbackRecord>> {
        Ok(self
            .state
            .read()
            .await
            .feedback
            .get(&(message_id.to_string(), user_id.to_string()))
            .cloned())
    }
}
