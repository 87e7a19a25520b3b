//! The `<use-tool>` markup protocol.
//!
//! The model asks for a tool by embedding one block in its output:
//!
//! ```text
//! <use-tool label="Get project details">
//! <get-project-info-by-id>
//! <project-id>2</project-id>
//! </get-project-info-by-id>
//! </use-tool>
//! ```
//!
//! The first complete block is parsed, the named tool runs, and a
//! `<result state="...">` block is spliced in before the last closing tag so
//! the invocation stays visible together with its outcome.

use std::sync::LazyLock;
use std::time::Instant;

use agentry_core::event::{DomainEvent, EventBus};
use agentry_core::memory::{MemoryEntry, MemoryKind, signature};
use agentry_core::store::ChatStore;
use agentry_core::tool::{SubAgentRunner, ToolCallRecord, ToolContext, ToolParams, ToolRegistry, ToolState};
use chrono::Utc;
use regex_lite::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::stream_event::{EventPayload, NodeData, RunStatus};

/// Closing tag of a tool block; also the marker a replace event targets.
pub const CLOSING_TAG: &str = "</use-tool>";

static TOOL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<use-tool[^>]*>([\s\S]*?)</use-tool>").expect("valid tool block pattern")
});

/// Deepest element nesting accepted inside a tool block.
const MAX_DEPTH: usize = 32;

/// A parsed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub params: ToolParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkupError {
    #[error("unexpected end of markup, expected {0}")]
    UnexpectedEnd(String),
    #[error("closing tag </{found}> does not match <{expected}>")]
    MismatchedTag { expected: String, found: String },
    #[error("unexpected closing tag </{0}>")]
    UnexpectedClosingTag(String),
    #[error("empty tag name at offset {0}")]
    EmptyTagName(usize),
    #[error("no element found")]
    NoElement,
    #[error("elements nested deeper than {0}")]
    TooDeep(usize),
}

/// Inner markup of the first complete tool block, if any.
pub fn find_tool_block(text: &str) -> Option<&str> {
    TOOL_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Parse the inner markup of a tool block. The first element names the
/// tool; its children are the parameters.
pub fn parse_invocation(markup: &str) -> Result<ToolInvocation, MarkupError> {
    let mut parser = MarkupParser {
        src: markup,
        pos: 0,
        depth: 0,
    };
    let elements = parser.parse_elements(None)?.elements;
    let (name, value) = elements.into_iter().next().ok_or(MarkupError::NoElement)?;

    let params = match value {
        Value::Object(map) => map,
        _ => ToolParams::new(),
    };
    Ok(ToolInvocation { name, params })
}

/// The `<result>` block reported back to the model.
pub fn result_block(record: &ToolCallRecord) -> String {
    format!(
        "<result state=\"{}\">\n{}\n</result>",
        record.state.as_str(),
        record.result
    )
}

/// Insert `block` before the last closing tag of `text`.
pub fn splice_result(text: &str, block: &str) -> Option<String> {
    let index = text.rfind(CLOSING_TAG)?;
    Some(format!("{}{}\n{}", &text[..index], block, &text[index..]))
}

/// Decide what this round's text means and, if it names a tool, run it.
///
/// Always records exactly one [`ToolCallRecord`] on `ctx`. Nothing here
/// fails the turn: malformed markup and unknown tools come back as failed
/// records for the model to read next round.
pub async fn resolve_tool_call(
    ctx: &RequestContext,
    tools: &ToolRegistry,
    max_round: u32,
    runner: &dyn SubAgentRunner,
    events: &EventBus,
) -> ToolCallRecord {
    let text = ctx.round_text();
    let round = ctx.round();

    let record = if round >= max_round {
        debug!(round, max_round, "Final round, output taken as the answer");
        ToolCallRecord::final_answer(text)
    } else {
        match find_tool_block(&text).map(parse_invocation) {
            None => ToolCallRecord::final_answer(text),
            Some(Err(e)) => {
                debug!(round, error = ?e, "Tool markup did not parse");
                ToolCallRecord::failed(None, "Tool call XML could not be parsed")
            }
            Some(Ok(invocation)) => execute(ctx, tools, invocation, runner, events).await,
        }
    };

    ctx.push_tool_call(record.clone());
    record
}

async fn execute(
    ctx: &RequestContext,
    tools: &ToolRegistry,
    invocation: ToolInvocation,
    runner: &dyn SubAgentRunner,
    events: &EventBus,
) -> ToolCallRecord {
    let ToolInvocation { name, params } = invocation;
    let title = tools.get(&name).map(|t| t.label().to_string());

    if let Some(title) = &title {
        ctx.emit(EventPayload::NodeStarted {
            data: NodeData {
                node_id: name.clone(),
                title: title.clone(),
                elapsed_time: None,
                status: RunStatus::Running,
                error: None,
            },
        });
    }

    let conversation_id = ctx.conversation_id();
    let message_id = ctx.message_id();
    let query = ctx.query();
    let tool_ctx = ToolContext {
        conversation_id: &conversation_id,
        message_id: &message_id,
        user_id: ctx.user_id(),
        query: &query,
        round: ctx.round(),
        runner,
    };

    info!(tool = %name, message_id = %message_id, round = tool_ctx.round, "Executing tool");
    let start = Instant::now();
    let record = tools.execute(&name, params, &tool_ctx).await;
    let elapsed = start.elapsed();
    let success = record.state == ToolState::Success;

    events.publish(DomainEvent::ToolExecuted {
        message_id: message_id.clone(),
        tool_name: name.clone(),
        success,
        duration_ms: elapsed.as_millis() as u64,
        timestamp: Utc::now(),
    });

    if let Some(title) = title {
        ctx.emit(EventPayload::NodeFinished {
            data: NodeData {
                node_id: name,
                title,
                elapsed_time: Some(elapsed.as_secs_f64()),
                status: if success { RunStatus::Succeeded } else { RunStatus::Failed },
                error: (!success).then(|| record.result.clone()),
            },
        });
    }

    record
}

/// Remember the last successful tool call of `ctx` for later rounds and turns.
///
/// The stored content is the round text with the result already spliced in.
pub async fn save_tool_call_memory(
    ctx: &RequestContext,
    tools: &ToolRegistry,
    store: &dyn ChatStore,
) -> agentry_core::Result<()> {
    let Some(record) = ctx.last_tool_call() else {
        return Ok(());
    };
    let Some(name) = record.name.as_deref() else {
        return Ok(());
    };
    let Some(tool) = tools.get(name) else {
        return Ok(());
    };
    if record.state != ToolState::Success || !tool.memory_enabled() {
        return Ok(());
    }

    let params = record.params.clone().unwrap_or_default();
    let ttl = chrono::Duration::from_std(tool.memory_ttl()).unwrap_or_else(|_| chrono::Duration::minutes(30));
    let now = Utc::now();
    let entry = MemoryEntry {
        signature: signature(name, &params),
        kind: MemoryKind::ToolCall,
        content: ctx.round_text(),
        conversation_id: ctx.conversation_id(),
        message_id: ctx.message_id(),
        expires_at: now + ttl,
        created_at: now,
        updated_at: now,
    };

    debug!(tool = %name, signature = %entry.signature, "Saving tool-call memory");
    store.upsert_memory(entry).await?;
    Ok(())
}

// ── Markup parsing ───────────────────────────────────────────────────────

struct Parsed {
    elements: Vec<(String, Value)>,
    text: String,
}

struct MarkupParser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl MarkupParser<'_> {
    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    /// Skip past `terminator`, failing if it never appears.
    fn skip_past(&mut self, terminator: &str) -> Result<&str, MarkupError> {
        let rest = &self.src[self.pos..];
        let end = rest
            .find(terminator)
            .ok_or_else(|| MarkupError::UnexpectedEnd(terminator.to_string()))?;
        self.pos += end + terminator.len();
        Ok(&rest[..end])
    }

    /// Parse sibling elements and text until `closing` (or the end, at top level).
    fn parse_elements(&mut self, closing: Option<&str>) -> Result<Parsed, MarkupError> {
        let mut elements = Vec::new();
        let mut text = String::new();

        loop {
            let Some(lt) = self.rest().find('<') else {
                text.push_str(&decode_entities(self.rest()));
                self.pos = self.src.len();
                return match closing {
                    Some(name) => Err(MarkupError::UnexpectedEnd(format!("</{name}>"))),
                    None => Ok(Parsed { elements, text }),
                };
            };
            text.push_str(&decode_entities(&self.rest()[..lt]));
            self.pos += lt;

            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let data = self.skip_past("]]>")?.to_string();
                text.push_str(&data);
            } else if rest.starts_with("<?") || rest.starts_with("<!") {
                self.skip_past(">")?;
            } else if let Some(after) = rest.strip_prefix("</") {
                let end = after
                    .find('>')
                    .ok_or_else(|| MarkupError::UnexpectedEnd(">".into()))?;
                let found = after[..end].trim().to_string();
                self.pos += 2 + end + 1;
                return match closing {
                    Some(expected) if expected == found => Ok(Parsed { elements, text }),
                    Some(expected) => Err(MarkupError::MismatchedTag {
                        expected: expected.to_string(),
                        found,
                    }),
                    None => Err(MarkupError::UnexpectedClosingTag(found)),
                };
            } else {
                let (name, value) = self.parse_element()?;
                elements.push((name, value));
            }
        }
    }

    fn parse_element(&mut self) -> Result<(String, Value), MarkupError> {
        self.pos += 1;
        let rest = self.rest();
        let name_len = rest
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')))
            .unwrap_or(rest.len());
        if name_len == 0 {
            return Err(MarkupError::EmptyTagName(self.pos));
        }
        let name = rest[..name_len].to_string();
        self.pos += name_len;

        // attributes are ignored; quoted values may contain '>'
        let mut quote = None;
        let mut self_closing = false;
        let mut end = None;
        let mut prev = ' ';
        for (i, c) in self.rest().char_indices() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'') => quote = Some(c),
                (None, '>') => {
                    self_closing = prev == '/';
                    end = Some(i);
                    break;
                }
                _ => {}
            }
            prev = c;
        }
        let end = end.ok_or_else(|| MarkupError::UnexpectedEnd(format!("<{name} ...>")))?;
        self.pos += end + 1;

        if self_closing {
            return Ok((name, Value::String(String::new())));
        }

        if self.depth == MAX_DEPTH {
            return Err(MarkupError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let inner = self.parse_elements(Some(&name))?;
        self.depth -= 1;
        Ok((name, element_value(inner)))
    }
}

fn element_value(parsed: Parsed) -> Value {
    if parsed.elements.is_empty() {
        return scalar(parsed.text.trim());
    }

    let mut map = serde_json::Map::new();
    for (name, value) in parsed.elements {
        match map.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(name, value);
            }
        }
    }
    let text = parsed.text.trim();
    if !text.is_empty() {
        map.insert("#text".into(), scalar(text));
    }
    Value::Object(map)
}

/// Numbers become JSON numbers; everything else stays a string.
fn scalar(text: &str) -> Value {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let plain_integer = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'));
    if plain_integer && let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }

    let plain_decimal = digits
        .split_once('.')
        .is_some_and(|(int, frac)| {
            !int.is_empty()
                && !frac.is_empty()
                && int.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
                && (int == "0" || !int.starts_with('0'))
        });
    if plain_decimal
        && let Ok(f) = text.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }

    Value::String(text.to_string())
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').and_then(|semi| {
            let entity = &rest[1..semi];
            let c = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
