//! Tool-call memory — TTL-bounded cache of earlier tool results.
//!
//! Entries are keyed by (signature, kind, conversation, message). Later
//! rounds and turns in the same conversation read the unexpired entries
//! back into the prompt instead of re-invoking the tool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    #[serde(rename = "toolcall")]
    ToolCall,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "toolcall",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "toolcall" => Some(Self::ToolCall),
            _ => None,
        }
    }
}

/// A single memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub signature: String,
    pub kind: MemoryKind,
    /// The round text the tool result was spliced into.
    pub content: String,
    pub conversation_id: String,
    pub message_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at > at
    }
}

/// Filter for listing memories.
#[derive(Debug, Clone)]
pub struct MemoryFilter {
    pub conversation_id: String,
    pub kind: MemoryKind,
    /// Only entries created strictly before this instant.
    pub created_before: DateTime<Utc>,
    /// Only entries whose expiry is after this instant.
    pub valid_at: DateTime<Utc>,
}

/// Deterministic signature of a tool invocation.
///
/// Object keys are sorted recursively before hashing, so the same call
/// yields the same signature whatever order the parameters arrived in.
pub fn signature(tool_name: &str, params: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&mut canonical, &serde_json::Value::Object(params.clone()));

    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
