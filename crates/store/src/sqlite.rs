//! SQLite store.
//!
//! Uses a single SQLite database file with four tables:
//! - `conversations` — owner, title, kind and the busy/normal/disabled status
//! - `messages` — inputs, query, process log, answer and status per turn
//! - `memories` — tool-call memory, unique on (signature, kind, conversation, message)
//! - `feedback` — like/dislike ratings, unique on (message, user)
//!
//! Timestamps are stored as fixed-width RFC 3339 strings with microseconds,
//! so string comparison in SQL orders them correctly.

use async_trait::async_trait;
use agentry_core::error::StoreError;
use agentry_core::memory::{MemoryEntry, MemoryFilter, MemoryKind};
use agentry_core::message::{
    ConversationKind, ConversationRecord, ConversationStatus, ConversationUpdate, FeedbackRecord,
    MessageRecord, MessageState, MessageUpdate, NewConversation, NewFeedback, NewMessage, Rating,
    new_id,
};
use agentry_core::store::{ChatStore, StoreResult};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use crate::MonotonicClock;

/// A SQLite-backed `ChatStore`.
pub struct SqliteStore {
    pool: SqlitePool,
    clock: MonotonicClock,
}

impl SqliteStore {
    /// Open (or create) a database.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            clock: MonotonicClock::default(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id          TEXT PRIMARY KEY NOT NULL,
                user_id     TEXT NOT NULL,
                title       TEXT NOT NULL DEFAULT '',
                kind        TEXT NOT NULL DEFAULT 'main',
                status      TEXT NOT NULL DEFAULT 'normal',
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id               TEXT PRIMARY KEY NOT NULL,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                agent            TEXT NOT NULL,
                inputs           TEXT NOT NULL DEFAULT '{}',
                query            TEXT NOT NULL DEFAULT '',
                process          TEXT NOT NULL DEFAULT '',
                answer           TEXT NOT NULL DEFAULT '',
                status           TEXT NOT NULL DEFAULT 'running',
                created_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                signature        TEXT NOT NULL,
                kind             TEXT NOT NULL,
                conversation_id  TEXT NOT NULL,
                message_id       TEXT NOT NULL,
                content          TEXT NOT NULL,
                expires_at       TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                PRIMARY KEY (signature, kind, conversation_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("memories table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memories_conversation ON memories(conversation_id, kind, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("memories index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feedback (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL,
                rating      TEXT NOT NULL,
                content     TEXT,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("feedback table: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationRecord, StoreError> {
        let kind: String = column(row, "kind")?;
        let status: String = column(row, "status")?;
        let created_at: String = column(row, "created_at")?;

        Ok(ConversationRecord {
            id: column(row, "id")?,
            user_id: column(row, "user_id")?,
            title: column(row, "title")?,
            kind: ConversationKind::parse(&kind)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown conversation kind {kind}")))?,
            status: ConversationStatus::parse(&status)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown conversation status {status}")))?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<MessageRecord, StoreError> {
        let inputs: String = column(row, "inputs")?;
        let status: String = column(row, "status")?;
        let created_at: String = column(row, "created_at")?;

        let inputs = serde_json::from_str(&inputs)
            .map_err(|e| StoreError::QueryFailed(format!("inputs column: {e}")))?;

        Ok(MessageRecord {
            id: column(row, "id")?,
            conversation_id: column(row, "conversation_id")?,
            agent: column(row, "agent")?,
            inputs,
            query: column(row, "query")?,
            process: column(row, "process")?,
            answer: column(row, "answer")?,
            status: MessageState::parse(&status)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown message status {status}")))?,
            created_at: parse_ts(&created_at)?,
        })
    }

    fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryEntry, StoreError> {
        let kind: String = column(row, "kind")?;
        let expires_at: String = column(row, "expires_at")?;
        let created_at: String = column(row, "created_at")?;
        let updated_at: String = column(row, "updated_at")?;

        Ok(MemoryEntry {
            signature: column(row, "signature")?,
            kind: MemoryKind::parse(&kind)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown memory kind {kind}")))?,
            content: column(row, "content")?,
            conversation_id: column(row, "conversation_id")?,
            message_id: column(row, "message_id")?,
            expires_at: parse_ts(&expires_at)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn row_to_feedback(row: &sqlx::sqlite::SqliteRow) -> Result<FeedbackRecord, StoreError> {
        let rating: String = column(row, "rating")?;
        let updated_at: String = column(row, "updated_at")?;

        Ok(FeedbackRecord {
            message_id: column(row, "message_id")?,
            user_id: column(row, "user_id")?,
            rating: Rating::parse(&rating)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown rating {rating}")))?,
            content: column(row, "content")?,
            updated_at: parse_ts(&updated_at)?,
        })
    }
}

fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("bad timestamp {s}: {e}")))
}

#[async_trait]
impl ChatStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
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

        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, kind, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.title)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT conversation failed: {e}")))?;

        debug!(conversation_id = %record.id, "Created conversation");
        Ok(record)
    }

    async fn get_conversation(&self, id: &str) -> StoreResult<Option<ConversationRecord>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT conversation: {e}")))?;

        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    async fn transition_conversation(
        &self,
        id: &str,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE conversations SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE conversation status: {e}")))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // distinguish "wrong status" from "no such conversation"
        match self.get_conversation(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                kind: "conversation",
                id: id.to_string(),
            }),
        }
    }

    async fn update_conversation(&self, id: &str, update: ConversationUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE conversations SET title = COALESCE(?1, title), status = COALESCE(?2, status) WHERE id = ?3",
        )
        .bind(update.title)
        .bind(update.status.map(|s| s.as_str()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE conversation: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "conversation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_message(&self, new: NewMessage) -> StoreResult<MessageRecord> {
        if self.get_conversation(&new.conversation_id).await?.is_none() {
            return Err(StoreError::NotFound {
                kind: "conversation",
                id: new.conversation_id,
            });
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
        let inputs = serde_json::to_string(&record.inputs)
            .map_err(|e| StoreError::Storage(format!("inputs serialization: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, agent, inputs, query, process, answer, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, '', '', ?6, ?7)
            "#,
        )
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(&record.agent)
        .bind(inputs)
        .bind(&record.query)
        .bind(record.status.as_str())
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT message failed: {e}")))?;

        debug!(message_id = %record.id, conversation_id = %record.conversation_id, "Created message");
        Ok(record)
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT message: {e}")))?;

        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn update_message(&self, id: &str, update: MessageUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET
                process = COALESCE(?1, process),
                answer = COALESCE(?2, answer),
                status = COALESCE(?3, status)
            WHERE id = ?4
            "#,
        )
        .bind(update.process)
        .bind(update.answer)
        .bind(update.status.map(|s| s.as_str()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE message: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "message",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<MessageRecord>> {
        // newest first so LIMIT keeps the most recent, then flip back to ascending
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at < ?2)
            ORDER BY created_at DESC
            LIMIT ?3
            "#,
        )
        .bind(conversation_id)
        .bind(before.map(ts))
        .bind(limit.map(|l| l as i64).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT messages: {e}")))?;

        let mut messages = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn upsert_memory(&self, entry: MemoryEntry) -> StoreResult<()> {
        let now = ts(self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO memories (signature, kind, conversation_id, message_id, content, expires_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(signature, kind, conversation_id, message_id) DO UPDATE SET
                content = excluded.content,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.signature)
        .bind(entry.kind.as_str())
        .bind(&entry.conversation_id)
        .bind(&entry.message_id)
        .bind(&entry.content)
        .bind(ts(entry.expires_at))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT memory failed: {e}")))?;

        debug!(signature = %entry.signature, message_id = %entry.message_id, "Upserted memory");
        Ok(())
    }

    async fn list_memories(&self, filter: MemoryFilter) -> StoreResult<Vec<MemoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM memories
            WHERE conversation_id = ?1 AND kind = ?2 AND created_at < ?3 AND expires_at > ?4
            ORDER BY created_at ASC
            "#,
        )
        .bind(&filter.conversation_id)
        .bind(filter.kind.as_str())
        .bind(ts(filter.created_before))
        .bind(ts(filter.valid_at))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("SELECT memories: {e}")))?;

        rows.iter().map(Self::row_to_memory).collect()
    }

    async fn upsert_feedback(&self, feedback: NewFeedback) -> StoreResult<FeedbackRecord> {
        if self.get_message(&feedback.message_id).await?.is_none() {
            return Err(StoreError::NotFound {
                kind: "message",
                id: feedback.message_id,
            });
        }

        let record = FeedbackRecord {
            message_id: feedback.message_id,
            user_id: feedback.user_id,
            rating: feedback.rating,
            content: feedback.content,
            updated_at: self.clock.now(),
        };
        sqlx::query(
            r#"
            INSERT INTO feedback (message_id, user_id, rating, content, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(message_id, user_id) DO UPDATE SET
                rating = excluded.rating,
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.user_id)
        .bind(record.rating.as_str())
        .bind(&record.content)
        .bind(ts(record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT feedback failed: {e}")))?;

        debug!(message_id = %record.message_id, rating = record.rating.as_str(), "Upserted feedback");
        Ok(record)
    }

    async fn delete_feedback(&self, message_id: &str, user_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM feedback WHERE message_id = ?1 AND user_id = ?2")
            .bind(message_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE feedback: {e}")))?;
        Ok(())
    }

    async fn get_feedback(&self, message_id: &str, user_id: &str) -> StoreResult<Option<FeedbackRecord>> {
        let row = sqlx::query("SELECT * FROM feedback WHERE message_id = ?1 AND user_id = ?2")
            .bind(message_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT feedback: {e}")))?;

        row.as_ref().map(Self::row_to_feedback).transpose()
    }
}
