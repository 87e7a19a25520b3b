//! User-prompt assembly.
//!
//! The default user prompt is built from up to six parts, in order:
//! conversation history, remembered tool calls, the turn's inputs, the
//! current query, this turn's tool-use log, and the final-round instruction.
//! Empty parts are left out.

use agentry_core::memory::{MemoryFilter, MemoryKind};
use agentry_core::store::{ChatStore, StoreResult};
use agentry_core::tool::ToolParams;
use chrono::{DateTime, Utc};

use crate::context::RequestContext;

const FINAL_ROUND_INSTRUCTION: &str = "This is the final round. Tools can no longer be used. Answer the user directly with the information you already have, and do not output any tool-use XML.";

/// Earlier exchanges of a conversation as `<user>`/`<assistant>` pairs.
pub async fn history_messages(
    store: &dyn ChatStore,
    conversation_id: &str,
    before: DateTime<Utc>,
) -> StoreResult<String> {
    let messages = store.list_messages(conversation_id, Some(before), None).await?;
    Ok(messages
        .iter()
        .map(|m| format!("<user>\n{}\n</user>\n<assistant>\n{}\n</assistant>", m.query, m.answer))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Tool calls remembered from earlier turns that have not expired.
pub async fn remembered_tool_calls(
    store: &dyn ChatStore,
    conversation_id: &str,
    before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StoreResult<String> {
    let entries = store
        .list_memories(MemoryFilter {
            conversation_id: conversation_id.to_string(),
            kind: MemoryKind::ToolCall,
            created_before: before,
            valid_at: now,
        })
        .await?;
    Ok(entries
        .into_iter()
        .map(|e| e.content)
        .collect::<Vec<_>>()
        .join("\n"))
}

pub fn history_section(history: &str) -> String {
    format!("<history-chats>\n\nConversation history:\n\n{history}\n\n</history-chats>")
}

pub fn tool_memory_section(memories: &str) -> String {
    format!(
        "<history-tool-use>\n\nTools used earlier in this conversation and their results (still valid, reuse them instead of calling the same tool again):\n\n{memories}\n\n</history-tool-use>"
    )
}

/// The turn's inputs as pretty JSON.
pub fn input_section(inputs: &ToolParams) -> String {
    let json = serde_json::to_string_pretty(inputs).unwrap_or_else(|_| "{}".into());
    format!("<input>\n{json}\n</input>")
}

pub fn query_section(query: &str) -> String {
    format!("current user input:\n{query}")
}

pub fn tool_process_section(process_log: &str) -> String {
    format!(
        "<current-tool-use>\n\nTools already used for the current input and their results:\n{process_log}\n\n</current-tool-use>"
    )
}

pub fn final_round_section() -> &'static str {
    FINAL_ROUND_INSTRUCTION
}

/// Assemble the default user prompt. `input` overrides the JSON input section.
pub async fn default_user_prompt(
    store: &dyn ChatStore,
    ctx: &RequestContext,
    max_round: u32,
    input: Option<String>,
) -> StoreResult<String> {
    let mut parts = Vec::new();

    if !ctx.is_first_message()
        && let Some(created_at) = ctx.message_created_at()
    {
        let conversation_id = ctx.conversation_id();
        let (history, memories) = tokio::try_join!(
            history_messages(store, &conversation_id, created_at),
            remembered_tool_calls(store, &conversation_id, created_at, Utc::now()),
        )?;
        if !history.is_empty() {
            parts.push(history_section(&history));
        }
        if !memories.is_empty() {
            parts.push(tool_memory_section(&memories));
        }
    }

    parts.push(input.unwrap_or_else(|| input_section(&ctx.inputs())));
    parts.push(query_section(&ctx.query()));

    let process_log = ctx.process_log();
    if !process_log.is_empty() {
        parts.push(tool_process_section(&process_log));
    }

    if ctx.round() >= max_round {
        parts.push(final_round_section().to_string());
    }

    Ok(parts.join("\n\n"))
}
