//! ChatStore trait — the persistence contract a turn reads and writes.
//!
//! Implementations: in-memory (tests, ephemeral runs) and SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::error::StoreError;
use crate::memory::{MemoryEntry, MemoryFilter};
use crate::message::{
    ConversationRecord, ConversationStatus, ConversationUpdate, FeedbackRecord, MessageRecord,
    MessageUpdate, NewConversation, NewFeedback, NewMessage,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Create a conversation in `busy` state.
    async fn create_conversation(&self, new: NewConversation) -> StoreResult<ConversationRecord>;

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<ConversationRecord>>;

    /// Atomically move a conversation from `from` to `to`.
    ///
    /// Returns `false` (and changes nothing) when the current status is not `from`.
    async fn transition_conversation(
        &self,
        id: &str,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> StoreResult<bool>;

    async fn update_conversation(&self, id: &str, update: ConversationUpdate) -> StoreResult<()>;

    /// Create a message in `running` state.
    async fn create_message(&self, new: NewMessage) -> StoreResult<MessageRecord>;

    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>>;

    async fn update_message(&self, id: &str, update: MessageUpdate) -> StoreResult<()>;

    /// Messages of a conversation in creation order, optionally only those
    /// created strictly before `before`, keeping the newest `limit` of them.
    async fn list_messages(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MessageRecord>>;

    /// Insert, or replace content and expiry of the entry with the same
    /// (signature, kind, conversation, message).
    async fn upsert_memory(&self, entry: MemoryEntry) -> StoreResult<()>;

    /// Matching memories in creation order.
    async fn list_memories(&self, filter: MemoryFilter) -> StoreResult<Vec<MemoryEntry>>;

    /// Insert, or replace rating and content of, the user's feedback on a message.
    async fn upsert_feedback(&self, feedback: NewFeedback) -> StoreResult<FeedbackRecord>;

    /// Remove the user's feedback on a message. Removing absent feedback is a no-op.
    async fn delete_feedback(&self, message_id: &str, user_id: &str) -> StoreResult<()>;

    async fn get_feedback(&self, message_id: &str, user_id: &str) -> StoreResult<Option<FeedbackRecord>>;
}
