//! Request contexts — the live state of one turn.
//!
//! A context is created when a turn begins and owns everything that turn
//! mutates: the round counter, the round text, the cross-round process log,
//! the tool-call records, the lifecycle state and the output channel.
//!
//! Contexts form a tree. A tool that delegates to a sub-agent registers the
//! sub-agent's context as a child, and [`RequestContext::stop`] walks the
//! tree synchronously: mark stopped, cancel the in-flight completion, stop
//! every child.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use agentry_core::error::TurnError;
use agentry_core::message::{ConversationKind, ConversationStatus, MessageState};
use agentry_core::store::ChatStore;
use agentry_core::tool::{ToolCallRecord, ToolParams};
use agentry_core::turn::TurnRequest;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::live::LiveContexts;
use crate::stream_event::{EventPayload, StreamEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct TurnState {
    conversation_id: String,
    message_id: String,
    query: String,
    inputs: ToolParams,
    is_first_message: bool,
    round: u32,
    round_text: String,
    process_log: String,
    tool_calls: Vec<ToolCallRecord>,
    state: MessageState,
    message_created_at: Option<DateTime<Utc>>,
    holds_lock: bool,
}

pub struct RequestContext {
    agent: String,
    user_id: String,
    title: String,
    kind: ConversationKind,
    requested_message: Option<String>,
    turn: Mutex<TurnState>,
    cancel: CancellationToken,
    output: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    parent: Mutex<Weak<RequestContext>>,
    children: Mutex<Vec<Arc<RequestContext>>>,
    cleaned: AtomicBool,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let turn = lock(&self.turn);
        f.debug_struct("RequestContext")
            .field("agent", &self.agent)
            .field("conversation_id", &turn.conversation_id)
            .field("message_id", &turn.message_id)
            .field("round", &turn.round)
            .field("state", &turn.state)
            .finish()
    }
}

impl RequestContext {
    /// Create a context for a blocking caller.
    pub fn new(request: &TurnRequest) -> Arc<Self> {
        Arc::new(Self::build(request, None))
    }

    /// Create a context whose events are sent to `output`.
    pub fn streaming(request: &TurnRequest, output: mpsc::UnboundedSender<StreamEvent>) -> Arc<Self> {
        Arc::new(Self::build(request, Some(output)))
    }

    fn build(request: &TurnRequest, output: Option<mpsc::UnboundedSender<StreamEvent>>) -> Self {
        let conversation_id = request.conversation_id.clone().unwrap_or_default();
        Self {
            agent: request.agent.clone(),
            user_id: request.user.clone(),
            title: request.title.clone(),
            kind: request.kind,
            requested_message: request.message_id.clone(),
            turn: Mutex::new(TurnState {
                is_first_message: conversation_id.is_empty(),
                conversation_id,
                query: request.query.clone(),
                inputs: request.inputs.clone(),
                ..TurnState::default()
            }),
            cancel: CancellationToken::new(),
            output: Mutex::new(output),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    /// The message id the caller asked to regenerate, if any.
    pub fn requested_message(&self) -> Option<&str> {
        self.requested_message.as_deref()
    }

    pub fn conversation_id(&self) -> String {
        lock(&self.turn).conversation_id.clone()
    }

    pub fn message_id(&self) -> String {
        lock(&self.turn).message_id.clone()
    }

    pub fn query(&self) -> String {
        lock(&self.turn).query.clone()
    }

    pub fn inputs(&self) -> ToolParams {
        lock(&self.turn).inputs.clone()
    }

    pub fn is_first_message(&self) -> bool {
        lock(&self.turn).is_first_message
    }

    pub fn message_created_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.turn).message_created_at
    }

    pub fn state(&self) -> MessageState {
        lock(&self.turn).state
    }

    pub fn round(&self) -> u32 {
        lock(&self.turn).round
    }

    pub fn is_first_round(&self) -> bool {
        self.round() == 1
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with `NotRunning` unless the context is still running.
    pub fn ensure_running(&self) -> Result<(), TurnError> {
        if self.state() == MessageState::Running {
            Ok(())
        } else {
            Err(TurnError::NotRunning)
        }
    }

    /// Start the next round: bump the counter and clear the round text.
    pub fn next_round(&self) -> u32 {
        let mut turn = lock(&self.turn);
        turn.round += 1;
        turn.round_text.clear();
        turn.round
    }

    /// Record that this turn acquired the conversation's busy lock.
    pub fn bind_conversation(&self, conversation_id: &str) {
        let mut turn = lock(&self.turn);
        turn.conversation_id = conversation_id.to_string();
        turn.holds_lock = true;
    }

    pub fn bind_message(&self, message_id: &str, created_at: DateTime<Utc>) {
        let mut turn = lock(&self.turn);
        turn.message_id = message_id.to_string();
        turn.message_created_at = Some(created_at);
    }

    /// Restore the inputs and query of a message being regenerated.
    pub fn replay(&self, query: String, inputs: ToolParams) {
        let mut turn = lock(&self.turn);
        turn.query = query;
        turn.inputs = inputs;
    }

    pub fn round_text(&self) -> String {
        lock(&self.turn).round_text.clone()
    }

    pub fn append_round_text(&self, text: &str) {
        lock(&self.turn).round_text.push_str(text);
    }

    pub fn set_round_text(&self, text: String) {
        lock(&self.turn).round_text = text;
    }

    pub fn process_log(&self) -> String {
        lock(&self.turn).process_log.clone()
    }

    /// Append the current round text to the process log and return the log.
    pub fn commit_round(&self) -> String {
        let mut turn = lock(&self.turn);
        let round_text = std::mem::take(&mut turn.round_text);
        turn.process_log.push('\n');
        turn.process_log.push_str(&round_text);
        turn.round_text = round_text;
        turn.process_log.clone()
    }

    pub fn push_tool_call(&self, record: ToolCallRecord) {
        lock(&self.turn).tool_calls.push(record);
    }

    pub fn last_tool_call(&self) -> Option<ToolCallRecord> {
        lock(&self.turn).tool_calls.last().cloned()
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        lock(&self.turn).tool_calls.clone()
    }

    /// Move from `running` to a terminal state. Returns `false` if already terminal.
    pub fn finish(&self, state: MessageState) -> bool {
        let mut turn = lock(&self.turn);
        if turn.state.is_terminal() || !state.is_terminal() {
            return false;
        }
        turn.state = state;
        true
    }

    /// Stop this context and every child, depth first.
    ///
    /// A context that is already terminal is left alone.
    pub fn stop(&self) {
        if !self.finish(MessageState::Stopped) {
            return;
        }
        debug!(message_id = %self.message_id(), "Stopping request");
        self.cancel.cancel();

        let children = lock(&self.children).clone();
        for child in children {
            child.stop();
        }
    }

    pub fn parent(&self) -> Option<Arc<RequestContext>> {
        lock(&self.parent).upgrade()
    }

    pub fn children(&self) -> Vec<Arc<RequestContext>> {
        lock(&self.children).clone()
    }

    /// Attach `child` under this context. A child registered after this
    /// context stopped is stopped immediately.
    pub fn register_child(self: &Arc<Self>, child: &Arc<RequestContext>) {
        *lock(&child.parent) = Arc::downgrade(self);
        lock(&self.children).push(child.clone());

        if self.state() != MessageState::Running {
            child.stop();
        }
    }

    fn remove_child(&self, child: &RequestContext) {
        lock(&self.children).retain(|c| !std::ptr::eq(Arc::as_ptr(c), child));
    }

    /// Whether this context has an output channel.
    pub fn is_streaming(&self) -> bool {
        lock(&self.output).is_some()
    }

    /// Send an event to the output channel, if there is one.
    pub fn emit(&self, payload: EventPayload) {
        let output = lock(&self.output);
        let Some(tx) = output.as_ref() else {
            return;
        };

        let (conversation_id, message_id) = {
            let turn = lock(&self.turn);
            (turn.conversation_id.clone(), turn.message_id.clone())
        };
        let event = StreamEvent {
            task_id: message_id.clone(),
            message_id,
            conversation_id,
            payload,
        };
        if tx.send(event).is_err() {
            debug!("Output receiver dropped, event discarded");
        }
    }

    /// Release everything this turn holds. Idempotent.
    ///
    /// Detaches from the parent and children, closes the output channel,
    /// unregisters from `live` and releases the conversation's busy lock.
    pub async fn clean_up(&self, live: &LiveContexts, store: &dyn ChatStore) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(parent) = self.parent() {
            parent.remove_child(self);
        }
        *lock(&self.parent) = Weak::new();
        let children = std::mem::take(&mut *lock(&self.children));
        for child in children {
            *lock(&child.parent) = Weak::new();
        }

        lock(&self.output).take();

        let (conversation_id, message_id, holds_lock) = {
            let turn = lock(&self.turn);
            (turn.conversation_id.clone(), turn.message_id.clone(), turn.holds_lock)
        };
        if !message_id.is_empty() {
            live.remove(&message_id, self);
        }

        if holds_lock {
            match store
                .transition_conversation(&conversation_id, ConversationStatus::Busy, ConversationStatus::Normal)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(conversation_id = %conversation_id, "Conversation was no longer busy"),
                Err(e) => warn!(conversation_id = %conversation_id, error = %e, "Failed to release conversation"),
            }
        }
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}
