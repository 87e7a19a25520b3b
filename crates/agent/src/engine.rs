//! The engine — entry point for running turns and the operations around them.
//!
//! Cloning is cheap; all state is shared. Every turn runs on its own task so
//! the context is always cleaned up, even when the caller goes away.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use agentry_config::AppConfig;
use agentry_core::error::{Error, ProviderError, Result, StoreError, TurnError};
use agentry_core::event::EventBus;
use agentry_core::message::{
    ConversationKind, ConversationRecord, ConversationStatus, ConversationUpdate, MessageRecord, NewFeedback,
    Rating,
};
use agentry_core::store::ChatStore;
use agentry_core::tool::{SubAgentRunner, Tool, ToolCallRecord, ToolRegistry};
use agentry_core::turn::{TurnRequest, TurnResult};
use agentry_core::MessageState;
use agentry_providers::ProviderRouter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::agent::Agent;
use crate::context::RequestContext;
use crate::invoker::{CompletionInvoker, ModelProfile};
use crate::live::LiveContexts;
use crate::persona::Persona;
use crate::stream_event::StreamEvent;

/// Default page size of [`Engine::history`].
pub const HISTORY_PAGE_SIZE: usize = 20;

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: AppConfig,
    router: ProviderRouter,
    store: Arc<dyn ChatStore>,
    events: Arc<EventBus>,
    live: LiveContexts,
    tools: RwLock<HashMap<Persona, ToolRegistry>>,
}

/// How a conversation gets its new name.
#[derive(Debug, Clone)]
pub enum RenameMode {
    Manual(String),
    /// Generate a title from the conversation's first query.
    Auto,
}

/// One page of a conversation's messages.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub limit: usize,
    pub has_more: bool,
    pub data: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryItem {
    pub id: String,
    pub conversation_id: String,
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub query: String,
    /// Process log followed by the final answer.
    pub answer: String,
    pub status: MessageState,
    pub created_at: DateTime<Utc>,
    /// The requesting user's rating, if any.
    pub feedback: Option<FeedbackSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackSummary {
    pub rating: Rating,
}

impl From<MessageRecord> for HistoryItem {
    fn from(message: MessageRecord) -> Self {
        Self {
            answer: message.full_answer(),
            id: message.id,
            conversation_id: message.conversation_id,
            inputs: message.inputs,
            query: message.query,
            status: message.status,
            created_at: message.created_at,
            feedback: None,
        }
    }
}

impl Engine {
    pub fn new(config: AppConfig, router: ProviderRouter, store: Arc<dyn ChatStore>, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                router,
                store,
                events,
                live: LiveContexts::default(),
                tools: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &dyn ChatStore {
        self.inner.store.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn live(&self) -> &LiveContexts {
        &self.inner.live
    }

    /// Add a tool to a persona. Replaces a tool of the same name.
    pub fn register_tool(&self, agent: &str, tool: Arc<dyn Tool>) -> Result<()> {
        let persona = Persona::parse(agent).ok_or_else(|| TurnError::AgentNotFound(agent.to_string()))?;
        debug!(agent, tool = tool.name(), "Registering tool");
        self.inner
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(persona)
            .or_default()
            .register(tool);
        Ok(())
    }

    pub fn tools_for(&self, persona: Persona) -> ToolRegistry {
        self.inner
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&persona)
            .cloned()
            .unwrap_or_default()
    }

    /// Bind the requested persona to its model, tools and round limit.
    pub fn agent_for(&self, request: &TurnRequest) -> Result<Agent> {
        let persona =
            Persona::parse(&request.agent).ok_or_else(|| TurnError::AgentNotFound(request.agent.clone()))?;
        let config = &self.inner.config;
        let profile = config.agents.get(persona.name());

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| config.model_for(persona.name()));
        let (provider, bare_model) = self
            .inner
            .router
            .resolve(&model)
            .ok_or_else(|| ProviderError::NotConfigured(model.clone()))?;
        let limits = config.model_limits(&model);
        let temperature = profile
            .and_then(|p| p.temperature)
            .unwrap_or(config.default_temperature);
        let max_round = profile
            .and_then(|p| p.max_round)
            .unwrap_or_else(|| persona.default_max_round());

        let invoker = CompletionInvoker::new(
            provider,
            ModelProfile {
                model: bare_model,
                temperature,
                context_window: limits.context_window,
                output_tokens: limits.output_tokens,
                token_encoding: limits.token_encoding,
            },
            config.engine.token_limit,
        );
        Ok(Agent::new(persona, self.tools_for(persona), max_round, invoker))
    }

    /// Run a turn to completion and return its result.
    pub async fn run_blocking(&self, request: TurnRequest) -> Result<TurnResult> {
        let agent = self.agent_for(&request)?;
        self.check_preconditions(&request).await?;
        let ctx = RequestContext::new(&request);
        self.drive(agent, ctx).await
    }

    /// Start a turn and return its event stream.
    ///
    /// Dropping the stream before the turn ends stops the turn.
    pub async fn run_streaming(&self, request: TurnRequest) -> Result<TurnStream> {
        let agent = self.agent_for(&request)?;
        self.check_preconditions(&request).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = RequestContext::streaming(&request, tx);
        let engine = self.clone();
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            // the outcome reaches the caller as stream events
            let _ = engine.execute(&agent, &task_ctx).await;
        });

        Ok(TurnStream {
            events: UnboundedReceiverStream::new(rx),
            ctx,
        })
    }

    /// Run a sub-agent turn as a child of `parent`.
    pub async fn run_child(&self, mut request: TurnRequest, parent: &Arc<RequestContext>) -> Result<TurnResult> {
        request.kind = ConversationKind::Sub;
        request.conversation_id = None;
        request.message_id = None;
        if request.user.is_empty() {
            request.user = parent.user_id().to_string();
        }

        let agent = self.agent_for(&request)?;
        let ctx = RequestContext::new(&request);
        parent.register_child(&ctx);
        debug!(agent = %request.agent, parent = %parent.message_id(), "Starting sub-agent");
        self.drive(agent, ctx).await
    }

    async fn drive(&self, agent: Agent, ctx: Arc<RequestContext>) -> Result<TurnResult> {
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.execute(&agent, &ctx).await });
        handle
            .await
            .map_err(|e| Error::Internal(format!("turn task failed: {e}")))?
    }

    async fn execute(&self, agent: &Agent, ctx: &Arc<RequestContext>) -> Result<TurnResult> {
        let outcome = agent.run(self, ctx).await;
        ctx.clean_up(self.live(), self.store()).await;

        let answer = outcome?;
        Ok(TurnResult {
            conversation_id: ctx.conversation_id(),
            message_id: ctx.message_id(),
            answer,
            status: ctx.state(),
            rounds: ctx.round(),
            tool_calls: ctx.tool_calls(),
        })
    }

    /// Reject a request that targets a conversation it may not run in.
    async fn check_preconditions(&self, request: &TurnRequest) -> Result<()> {
        let Some(conversation_id) = &request.conversation_id else {
            if request.message_id.is_some() {
                return Err(TurnError::Forbidden("a regenerated message needs its conversation".into()).into());
            }
            return Ok(());
        };

        let conversation = self.conversation(conversation_id).await?;
        match conversation.status {
            ConversationStatus::Busy => return Err(TurnError::ConversationBusy(conversation.id).into()),
            ConversationStatus::Disabled => return Err(TurnError::ConversationDisabled(conversation.id).into()),
            ConversationStatus::Normal => {}
        }
        if conversation.user_id != request.user {
            return Err(TurnError::Forbidden(format!("conversation {conversation_id}")).into());
        }

        if let Some(message_id) = &request.message_id {
            let message = self.message(message_id).await?;
            if &message.conversation_id != conversation_id {
                return Err(TurnError::Forbidden(format!("message {message_id}")).into());
            }
        }
        Ok(())
    }

    /// Stop the running turn that produces `message_id`.
    pub async fn stop(&self, message_id: &str, user: &str) -> Result<()> {
        let message = self.message(message_id).await?;
        self.owned_conversation(&message.conversation_id, user).await?;

        let ctx = self
            .inner
            .live
            .get(message_id)
            .ok_or_else(|| TurnError::ContextNotFound(message_id.to_string()))?;
        info!(message_id, "Stop requested");
        ctx.stop();
        Ok(())
    }

    pub async fn delete_conversation(&self, conversation_id: &str, user: &str) -> Result<()> {
        self.owned_conversation(conversation_id, user).await?;
        self.store()
            .update_conversation(
                conversation_id,
                ConversationUpdate {
                    status: Some(ConversationStatus::Disabled),
                    ..Default::default()
                },
            )
            .await?;
        info!(conversation_id, "Conversation disabled");
        Ok(())
    }

    /// Rename a conversation and return the new title.
    pub async fn rename_conversation(&self, conversation_id: &str, user: &str, mode: RenameMode) -> Result<String> {
        self.owned_conversation(conversation_id, user).await?;

        let title = match mode {
            RenameMode::Manual(name) => name,
            RenameMode::Auto => {
                let first = self
                    .store()
                    .list_messages(conversation_id, None, None)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| StoreError::NotFound {
                        kind: "message",
                        id: format!("first message of {conversation_id}"),
                    })?;
                let request = TurnRequest::new(Persona::AutoName.name(), user, first.query)
                    .with_kind(ConversationKind::Sub);
                self.run_blocking(request).await?.answer.trim().to_string()
            }
        };

        self.store()
            .update_conversation(
                conversation_id,
                ConversationUpdate {
                    title: Some(title.clone()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(title)
    }

    /// Three follow-up questions for a finished message.
    pub async fn suggest_questions(&self, message_id: &str, user: &str) -> Result<Vec<String>> {
        let message = self.message(message_id).await?;
        self.owned_conversation(&message.conversation_id, user).await?;

        let request = TurnRequest::new(Persona::Suggest.name(), user, "")
            .with_kind(ConversationKind::Sub)
            .with_input("user", message.query.clone())
            .with_input("assistant", message.full_answer());
        let answer = self.run_blocking(request).await?.answer;

        serde_json::from_str::<Vec<String>>(answer.trim())
            .map_err(|e| TurnError::InvalidOutput(format!("suggested questions are not a JSON list: {e}")).into())
    }

    /// A page of messages, newest page first; `first_id` pages further back.
    pub async fn history(
        &self,
        conversation_id: &str,
        user: &str,
        first_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<HistoryPage> {
        self.owned_conversation(conversation_id, user).await?;
        let limit = limit.unwrap_or(HISTORY_PAGE_SIZE).max(1);

        let before = match first_id {
            Some(id) => Some(self.message(id).await?.created_at),
            None => None,
        };
        let messages = self.store().list_messages(conversation_id, before, Some(limit)).await?;

        let has_more = messages.len() == limit;

        let mut data = Vec::with_capacity(messages.len());
        for message in messages {
            let feedback = self.store().get_feedback(&message.id, user).await?;
            let mut item = HistoryItem::from(message);
            item.feedback = feedback.map(|f| FeedbackSummary { rating: f.rating });
            data.push(item);
        }

        Ok(HistoryPage { limit, has_more, data })
    }

    /// Rate a message. `None` withdraws the user's rating.
    pub async fn feedback_message(
        &self,
        message_id: &str,
        user: &str,
        rating: Option<Rating>,
        content: Option<String>,
    ) -> Result<()> {
        let message = self.message(message_id).await?;
        self.owned_conversation(&message.conversation_id, user).await?;

        match rating {
            Some(rating) => {
                self.store()
                    .upsert_feedback(NewFeedback {
                        message_id: message_id.to_string(),
                        user_id: user.to_string(),
                        rating,
                        content,
                    })
                    .await?;
                debug!(message_id, rating = rating.as_str(), "Feedback recorded");
            }
            None => {
                self.store().delete_feedback(message_id, user).await?;
                debug!(message_id, "Feedback withdrawn");
            }
        }
        Ok(())
    }

    async fn conversation(&self, id: &str) -> Result<ConversationRecord> {
        Ok(self.store().get_conversation(id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "conversation",
            id: id.to_string(),
        })?)
    }

    async fn owned_conversation(&self, id: &str, user: &str) -> Result<ConversationRecord> {
        let conversation = self.conversation(id).await?;
        if conversation.user_id != user {
            return Err(TurnError::Forbidden(format!("conversation {id}")).into());
        }
        Ok(conversation)
    }

    async fn message(&self, id: &str) -> Result<MessageRecord> {
        Ok(self.store().get_message(id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "message",
            id: id.to_string(),
        })?)
    }
}

/// Lets tools run sub-agents under the context that invoked them.
pub struct ChildRunner {
    engine: Engine,
    parent: Arc<RequestContext>,
}

impl ChildRunner {
    pub fn new(engine: Engine, parent: Arc<RequestContext>) -> Self {
        Self { engine, parent }
    }
}

#[async_trait]
impl SubAgentRunner for ChildRunner {
    async fn run_sub_agent(&self, request: TurnRequest) -> Result<TurnResult> {
        self.engine.run_child(request, &self.parent).await
    }
}

/// Events of a streaming turn.
///
/// Ends after the terminal event. Dropping it early stops the turn.
pub struct TurnStream {
    events: UnboundedReceiverStream<StreamEvent>,
    ctx: Arc<RequestContext>,
}

impl TurnStream {
    pub fn context(&self) -> &Arc<RequestContext> {
        &self.ctx
    }

    pub fn stop(&self) {
        self.ctx.stop();
    }

    /// Tool calls recorded so far.
    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        self.ctx.tool_calls()
    }
}

impl Stream for TurnStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().events).poll_next(cx)
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if self.ctx.state() == MessageState::Running {
            debug!(message_id = %self.ctx.message_id(), "Stream dropped, stopping turn");
            self.ctx.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_event::{EventPayload, RunStatus, WorkflowData};
    use crate::test_helpers::{Script, ScriptedProvider};
    use agentry_config::AgentProfileConfig;
    use agentry_core::error::ToolError;
    use agentry_core::event::DomainEvent;
    use agentry_core::message::NewConversation;
    use agentry_core::tool::{ToolContext, ToolParameter, ToolParams, ToolState};
    use agentry_store::InMemoryStore;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PROJECT_CALL: &str = "Let me check.\n<use-tool label=\"Get project details\">\n<get-project-info-by-id>\n<project-id>2</project-id>\n</get-project-info-by-id>\n</use-tool>";

    struct ProjectTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for ProjectTool {
        fn name(&self) -> &str { "get-project-info-by-id" }
        fn label(&self) -> &str { "Get project details" }
        fn description(&self) -> &str { "Project details by id" }
        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter::new("project-id", "Project id")]
        }
        async fn execute(&self, params: &ToolParams, _ctx: &ToolContext<'_>) -> std::result::Result<String, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{{\"id\":{},\"projectName\":\"OpenX\"}}", params["project-id"]))
        }
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str { "search-project-by-keyword" }
        fn label(&self) -> &str { "Search projects" }
        fn description(&self) -> &str { "Project search" }
        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter::new("keyword", "Keyword")]
        }
        async fn execute(&self, _params: &ToolParams, _ctx: &ToolContext<'_>) -> std::result::Result<String, ToolError> {
            let rows: Vec<String> = Vec::new();
            Ok(rows[0].clone())
        }
    }

    /// Delegates to the web-search persona.
    struct DelegatingTool;

    #[async_trait]
    impl Tool for DelegatingTool {
        fn name(&self) -> &str { "web-search" }
        fn label(&self) -> &str { "Search the web" }
        fn description(&self) -> &str { "Web search" }
        fn parameters(&self) -> Vec<ToolParameter> {
            vec![ToolParameter::new("query", "Search query")]
        }
        async fn execute(&self, params: &ToolParams, ctx: &ToolContext<'_>) -> std::result::Result<String, ToolError> {
            let query = params.get("query").and_then(|q| q.as_str()).unwrap_or_default();
            let result = ctx
                .run_sub_agent(TurnRequest::new("web-search", ctx.user_id, query))
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "web-search".into(),
                    reason: e.to_string(),
                })?;
            Ok(result.answer)
        }
    }

    struct Harness {
        engine: Engine,
        provider: Arc<ScriptedProvider>,
        store: Arc<InMemoryStore>,
    }

    fn harness_with(mut config: AppConfig, scripts: Vec<Script>) -> Harness {
        config.default_provider = "scripted".into();
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let mut router = ProviderRouter::new("scripted");
        router.register("scripted", provider.clone());
        let store = Arc::new(InMemoryStore::new());
        let engine = Engine::new(config, router, store.clone(), Arc::new(EventBus::default()));
        Harness { engine, provider, store }
    }

    fn harness(scripts: Vec<Script>) -> Harness {
        harness_with(AppConfig::default(), scripts)
    }

    fn texts(texts: &[&str]) -> Vec<Script> {
        texts.iter().map(|t| Script::text(t)).collect()
    }

    fn last_user_prompt(provider: &ScriptedProvider, index: usize) -> String {
        provider.requests()[index]
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    async fn idle_conversation(store: &InMemoryStore, user: &str) -> String {
        let conversation = store
            .create_conversation(NewConversation {
                user_id: user.into(),
                title: String::new(),
                kind: ConversationKind::Main,
            })
            .await
            .unwrap();
        store
            .transition_conversation(&conversation.id, ConversationStatus::Busy, ConversationStatus::Normal)
            .await
            .unwrap();
        conversation.id
    }

    async fn wait_for_calls(provider: &ScriptedProvider, calls: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while provider.call_count() < calls {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn single_round_answer() {
        let h = harness(texts(&["Hello! How can I help?"]));
        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "hi")).await.unwrap();

        assert_eq!(result.answer, "Hello! How can I help?");
        assert_eq!(result.status, MessageState::Success);
        assert_eq!(result.rounds, 1);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.tool_calls[0].output);

        let message = h.store.get_message(&result.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageState::Success);
        assert_eq!(message.answer, "Hello! How can I help?");
        let conversation = h.store.get_conversation(&result.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Normal);
        assert!(h.engine.live().is_empty());
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let h = harness(texts(&[PROJECT_CALL, "The project id is 2."]));
        let tool = Arc::new(ProjectTool { calls: AtomicUsize::new(0) });
        h.engine.register_tool("chat", tool.clone()).unwrap();

        let result = h
            .engine
            .run_blocking(TurnRequest::new("chat", "u1", "What is the project id?"))
            .await
            .unwrap();

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.answer, "The project id is 2.");
        assert_eq!(result.tool_calls.len(), 2);
        assert_eq!(result.tool_calls[0].state, ToolState::Success);
        assert!(!result.tool_calls[0].output);
        assert!(result.tool_calls[1].output);

        // the second round sees the first round's call with its result
        let second = last_user_prompt(&h.provider, 1);
        assert!(second.contains("<current-tool-use>"));
        assert!(second.contains("<result state=\"success\">\n{\"id\":2,\"projectName\":\"OpenX\"}\n</result>\n</use-tool>"));

        let message = h.store.get_message(&result.message_id).await.unwrap().unwrap();
        assert!(message.process.starts_with("\nLet me check."));
        assert!(message.process.contains("<result state=\"success\">"));
        assert_eq!(message.full_answer(), format!("{}\nThe project id is 2.", message.process));
    }

    #[tokio::test]
    async fn final_round_takes_markup_as_answer() {
        let mut config = AppConfig::default();
        config.agents.insert(
            "chat".into(),
            AgentProfileConfig {
                max_round: Some(1),
                ..Default::default()
            },
        );
        let h = harness_with(config, texts(&[PROJECT_CALL]));
        let tool = Arc::new(ProjectTool { calls: AtomicUsize::new(0) });
        h.engine.register_tool("chat", tool.clone()).unwrap();

        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q")).await.unwrap();
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.answer, PROJECT_CALL);
        assert!(last_user_prompt(&h.provider, 0).contains("final round"));
    }

    #[tokio::test]
    async fn tool_memory_reaches_the_next_turn() {
        let h = harness(texts(&[PROJECT_CALL, "It is 2.", "Still 2."]));
        h.engine
            .register_tool("chat", Arc::new(ProjectTool { calls: AtomicUsize::new(0) }))
            .unwrap();

        let first = h.engine.run_blocking(TurnRequest::new("chat", "u1", "Project id?")).await.unwrap();
        h.engine
            .run_blocking(TurnRequest::new("chat", "u1", "Again?").with_conversation(&first.conversation_id))
            .await
            .unwrap();

        let prompt = last_user_prompt(&h.provider, 2);
        assert!(prompt.contains("<history-chats>"));
        assert!(prompt.contains("<user>\nProject id?\n</user>\n<assistant>\nIt is 2.\n</assistant>"));
        assert!(prompt.contains("<history-tool-use>"));
        assert!(prompt.contains("projectName"));
    }

    #[tokio::test]
    async fn streaming_event_order() {
        let h = harness(vec![Script::chunks(&["Hel", "lo"])]);
        let stream = h.engine.run_streaming(TurnRequest::new("chat", "u1", "hi")).await.unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["workflow_started", "message", "message", "workflow_finished"]);
        assert_eq!(
            events[3].payload,
            EventPayload::WorkflowFinished {
                data: WorkflowData {
                    status: RunStatus::Succeeded
                }
            }
        );
        assert!(events.iter().all(|e| e.message_id == events[0].message_id && e.task_id == e.message_id));
    }

    #[tokio::test]
    async fn streaming_tool_round_emits_nodes_and_replace() {
        let h = harness(texts(&[PROJECT_CALL, "Done."]));
        h.engine
            .register_tool("chat", Arc::new(ProjectTool { calls: AtomicUsize::new(0) }))
            .unwrap();
        let stream = h.engine.run_streaming(TurnRequest::new("chat", "u1", "q")).await.unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec![
                "workflow_started",
                "message",
                "node_started",
                "node_finished",
                "message_replace",
                "message",
                "workflow_finished"
            ]
        );
        let EventPayload::MessageReplace { answer_replace, answer } = &events[4].payload else {
            panic!("expected message_replace");
        };
        assert_eq!(answer_replace, "</use-tool>");
        assert!(answer.starts_with("<result state=\"success\">"));
        assert!(answer.ends_with("</result>\n</use-tool>"));
    }

    #[tokio::test]
    async fn stop_during_streaming() {
        let h = harness(vec![Script::chunks(&["Thinking"]).hang()]);
        let mut stream = h.engine.run_streaming(TurnRequest::new("chat", "u1", "q")).await.unwrap();

        let started = stream.next().await.unwrap();
        assert_eq!(started.event_type(), "workflow_started");
        let chunk = stream.next().await.unwrap();
        assert_eq!(chunk.event_type(), "message");

        h.engine.stop(&started.message_id, "u1").await.unwrap();
        let rest: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(
            rest[0].payload,
            EventPayload::WorkflowFinished {
                data: WorkflowData {
                    status: RunStatus::Stopped
                }
            }
        );

        let message = h.store.get_message(&started.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageState::Stopped);
        assert_eq!(message.answer, "Thinking");
        let conversation = h.store.get_conversation(&started.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Normal);
        assert!(h.engine.live().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_turn() {
        let h = harness(vec![Script::chunks(&["Thinking"]).hang()]);
        let mut events = h.engine.events().subscribe();
        let mut stream = h.engine.run_streaming(TurnRequest::new("chat", "u1", "q")).await.unwrap();
        let started = stream.next().await.unwrap();
        drop(stream);

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if let DomainEvent::TurnFinished { status, .. } = &*event {
                    return *status;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished, MessageState::Stopped);

        let message = h.store.get_message(&started.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageState::Stopped);
    }

    #[tokio::test]
    async fn stopping_a_parent_stops_its_sub_agent() {
        let h = harness(vec![
            Script::text("<use-tool><web-search><query>members</query></web-search></use-tool>"),
            Script::chunks(&["partial"]).hang(),
        ]);
        h.engine.register_tool("chat", Arc::new(DelegatingTool)).unwrap();
        let mut events = h.engine.events().subscribe();

        let engine = h.engine.clone();
        let turn = tokio::spawn(async move { engine.run_blocking(TurnRequest::new("chat", "u1", "Who works on OpenX?")).await });
        wait_for_calls(&h.provider, 2).await;

        let mut started = Vec::new();
        while started.len() < 2 {
            if let DomainEvent::TurnStarted { message_id, agent, .. } = &*events.recv().await.unwrap() {
                started.push((agent.clone(), message_id.clone()));
            }
        }
        assert_eq!(started[0].0, "chat");
        assert_eq!(started[1].0, "web-search");
        assert_eq!(h.engine.live().len(), 2);

        h.engine.stop(&started[0].1, "u1").await.unwrap();
        let err = turn.await.unwrap().unwrap_err();
        assert!(err.is_stopped());

        for (_, message_id) in &started {
            let message = h.store.get_message(message_id).await.unwrap().unwrap();
            assert_eq!(message.status, MessageState::Stopped);
        }
        assert!(h.engine.live().is_empty());

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(&*event, DomainEvent::TurnFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn sub_agent_answer_becomes_tool_result() {
        let h = harness(texts(&[
            "<use-tool><web-search><query>members</query></web-search></use-tool>",
            "<search-result title=\"Team\" url=\"https://example.com\">\nAlice\n</search-result>",
            "Alice works on it.",
        ]));
        h.engine.register_tool("chat", Arc::new(DelegatingTool)).unwrap();

        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "Who?")).await.unwrap();
        assert_eq!(result.answer, "Alice works on it.");
        assert!(result.tool_calls[0].result.contains("Alice"));
        assert!(last_user_prompt(&h.provider, 1).contains("<user>\nmembers\n</user>"));
    }

    #[tokio::test]
    async fn provider_failure_marks_message_failed() {
        let h = harness(vec![Script::fail(ProviderError::Network("connection reset".into()))]);
        let mut events = h.engine.events().subscribe();

        let err = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q")).await.unwrap_err();
        assert!(!err.is_stopped());

        let mut failed_message = None;
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::TurnFailed { message_id, .. } = &*event {
                failed_message = Some(message_id.clone());
            }
        }
        let message_id = failed_message.unwrap();
        let message = h.store.get_message(&message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageState::Failed);
        let conversation = h.store.get_conversation(&message.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Normal);
    }

    #[tokio::test]
    async fn streaming_failure_ends_with_error_event() {
        let h = harness(vec![Script::fail(ProviderError::Network("connection reset".into()))]);
        let stream = h.engine.run_streaming(TurnRequest::new("chat", "u1", "q")).await.unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(events.last().map(|e| e.event_type()), Some("error"));
    }

    #[tokio::test]
    async fn preconditions_reject_before_any_state() {
        let h = harness(texts(&["unused"]));
        let busy = h
            .store
            .create_conversation(NewConversation {
                user_id: "u1".into(),
                title: String::new(),
                kind: ConversationKind::Main,
            })
            .await
            .unwrap();

        let err = h
            .engine
            .run_blocking(TurnRequest::new("chat", "u1", "q").with_conversation(&busy.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::ConversationBusy(_))));

        let idle = idle_conversation(&h.store, "u1").await;
        let err = h
            .engine
            .run_streaming(TurnRequest::new("chat", "u2", "q").with_conversation(&idle))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Turn(TurnError::Forbidden(_))));

        h.engine.delete_conversation(&idle, "u1").await.unwrap();
        let err = h
            .engine
            .run_blocking(TurnRequest::new("chat", "u1", "q").with_conversation(&idle))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::ConversationDisabled(_))));

        let err = h.engine.run_blocking(TurnRequest::new("poet", "u1", "q")).await.unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::AgentNotFound(_))));

        assert_eq!(h.provider.call_count(), 0);
        assert!(h.store.list_messages(&idle, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn regenerate_replays_stored_query() {
        let h = harness(texts(&["First answer", "Second answer"]));
        let first = h
            .engine
            .run_blocking(TurnRequest::new("chat", "u1", "original question"))
            .await
            .unwrap();

        let again = h
            .engine
            .run_blocking(
                TurnRequest::new("chat", "u1", "")
                    .with_conversation(&first.conversation_id)
                    .with_message(&first.message_id),
            )
            .await
            .unwrap();

        assert_eq!(again.message_id, first.message_id);
        assert!(last_user_prompt(&h.provider, 1).contains("current user input:\noriginal question"));
        let message = h.store.get_message(&first.message_id).await.unwrap().unwrap();
        assert_eq!(message.answer, "Second answer");
        assert_eq!(message.query, "original question");
    }

    #[tokio::test]
    async fn stop_checks_owner_and_liveness() {
        let h = harness(texts(&["done"]));
        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q")).await.unwrap();

        let err = h.engine.stop(&result.message_id, "u2").await.unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::Forbidden(_))));

        let err = h.engine.stop(&result.message_id, "u1").await.unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::ContextNotFound(_))));

        let err = h.engine.stop("missing", "u1").await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn rename_manual_and_auto() {
        let h = harness(texts(&["OpenX is a platform.", "  OpenX overview \n"]));
        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "What is OpenX?")).await.unwrap();

        let title = h
            .engine
            .rename_conversation(&result.conversation_id, "u1", RenameMode::Manual("Mine".into()))
            .await
            .unwrap();
        assert_eq!(title, "Mine");

        let title = h
            .engine
            .rename_conversation(&result.conversation_id, "u1", RenameMode::Auto)
            .await
            .unwrap();
        assert_eq!(title, "OpenX overview");
        assert_eq!(
            last_user_prompt(&h.provider, 1),
            "The text provided by the user:\n\nWhat is OpenX?"
        );
        let conversation = h.store.get_conversation(&result.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.title, "OpenX overview");
    }

    #[tokio::test]
    async fn suggested_questions_parse_json() {
        let h = harness(texts(&["An answer.", "[\"Q1\", \"Q2\", \"Q3\"]", "not json"]));
        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q")).await.unwrap();

        let questions = h.engine.suggest_questions(&result.message_id, "u1").await.unwrap();
        assert_eq!(questions, vec!["Q1", "Q2", "Q3"]);

        let err = h.engine.suggest_questions(&result.message_id, "u1").await.unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::InvalidOutput(_))));
    }

    #[tokio::test]
    async fn history_pages_backwards() {
        let h = harness(texts(&["a1", "a2", "a3"]));
        let first = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q1")).await.unwrap();
        for q in ["q2", "q3"] {
            h.engine
                .run_blocking(TurnRequest::new("chat", "u1", q).with_conversation(&first.conversation_id))
                .await
                .unwrap();
        }

        let page = h.engine.history(&first.conversation_id, "u1", None, Some(2)).await.unwrap();
        assert!(page.has_more);
        let queries: Vec<&str> = page.data.iter().map(|m| m.query.as_str()).collect();
        assert_eq!(queries, vec!["q2", "q3"]);

        let older = h
            .engine
            .history(&first.conversation_id, "u1", Some(&page.data[0].id), Some(2))
            .await
            .unwrap();
        assert!(!older.has_more);
        assert_eq!(older.data.len(), 1);
        assert_eq!(older.data[0].answer, "a1");

        let err = h.engine.history(&first.conversation_id, "u2", None, None).await.unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::Forbidden(_))));
    }

    #[tokio::test]
    async fn feedback_shows_in_history_and_can_be_withdrawn() {
        let h = harness(texts(&["a1"]));
        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q1")).await.unwrap();
        let rating_in_history = |page: &HistoryPage| page.data[0].feedback.as_ref().map(|f| f.rating);

        h.engine
            .feedback_message(&result.message_id, "u1", Some(Rating::Like), None)
            .await
            .unwrap();
        let page = h.engine.history(&result.conversation_id, "u1", None, None).await.unwrap();
        assert_eq!(rating_in_history(&page), Some(Rating::Like));

        h.engine
            .feedback_message(&result.message_id, "u1", Some(Rating::Dislike), Some("off topic".into()))
            .await
            .unwrap();
        let stored = h.store.get_feedback(&result.message_id, "u1").await.unwrap().unwrap();
        assert_eq!(stored.rating, Rating::Dislike);
        assert_eq!(stored.content.as_deref(), Some("off topic"));

        h.engine.feedback_message(&result.message_id, "u1", None, None).await.unwrap();
        let page = h.engine.history(&result.conversation_id, "u1", None, None).await.unwrap();
        assert_eq!(rating_in_history(&page), None);
    }

    #[tokio::test]
    async fn feedback_requires_owned_message() {
        let h = harness(texts(&["a1"]));
        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q1")).await.unwrap();

        let err = h
            .engine
            .feedback_message(&result.message_id, "u2", Some(Rating::Like), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::Forbidden(_))));
        assert!(h.store.get_feedback(&result.message_id, "u2").await.unwrap().is_none());

        let err = h.engine.feedback_message("missing", "u1", Some(Rating::Like), None).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn register_tool_rejects_unknown_persona() {
        let h = harness(vec![]);
        let err = h
            .engine
            .register_tool("poet", Arc::new(ProjectTool { calls: AtomicUsize::new(0) }))
            .unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn second_round_markup_is_the_answer_at_max_round_two() {
        let mut config = AppConfig::default();
        config.agents.insert(
            "chat".into(),
            AgentProfileConfig {
                max_round: Some(2),
                ..Default::default()
            },
        );
        let h = harness_with(config, texts(&[PROJECT_CALL, PROJECT_CALL]));
        let tool = Arc::new(ProjectTool { calls: AtomicUsize::new(0) });
        h.engine.register_tool("chat", tool.clone()).unwrap();

        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "Project id?")).await.unwrap();

        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.rounds, 2);
        assert_eq!(result.status, MessageState::Success);
        assert_eq!(result.answer, PROJECT_CALL);
        assert_eq!(result.tool_calls.len(), 2);
        assert_eq!(result.tool_calls[0].state, ToolState::Success);
        assert!(!result.tool_calls[0].output);
        assert!(result.tool_calls[1].output);
        assert!(!last_user_prompt(&h.provider, 0).contains("final round"));
        assert!(last_user_prompt(&h.provider, 1).contains("final round"));
    }

    #[tokio::test]
    async fn tool_panic_is_reported_to_the_model() {
        let h = harness(texts(&[
            "<use-tool><search-project-by-keyword><keyword>x</keyword></search-project-by-keyword></use-tool>",
            "The search is unavailable.",
            "Next answer.",
        ]));
        h.engine.register_tool("chat", Arc::new(PanickingTool)).unwrap();

        let result = h.engine.run_blocking(TurnRequest::new("chat", "u1", "Find x")).await.unwrap();
        assert_eq!(result.answer, "The search is unavailable.");
        assert_eq!(result.tool_calls[0].state, ToolState::Failed);
        assert!(result.tool_calls[0].result.contains("panicked"));
        assert!(last_user_prompt(&h.provider, 1).contains("<result state=\"failed\">"));

        let conversation = h.store.get_conversation(&result.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Normal);
        assert!(h.engine.live().is_empty());

        let next = h
            .engine
            .run_blocking(TurnRequest::new("chat", "u1", "Again").with_conversation(&result.conversation_id))
            .await
            .unwrap();
        assert_eq!(next.answer, "Next answer.");
    }

    #[tokio::test]
    async fn panic_in_a_round_releases_the_conversation() {
        let h = harness(vec![Script::panic(), Script::text("Recovered.")]);
        let mut events = h.engine.events().subscribe();

        let err = h.engine.run_blocking(TurnRequest::new("chat", "u1", "q")).await.unwrap_err();
        assert!(!err.is_stopped());
        assert!(err.to_string().contains("scripted provider panicked"));

        let mut failed = None;
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::TurnFailed {
                conversation_id,
                message_id,
                ..
            } = &*event
            {
                failed = Some((conversation_id.clone(), message_id.clone()));
            }
        }
        let (conversation_id, message_id) = failed.unwrap();
        let message = h.store.get_message(&message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageState::Failed);
        let conversation = h.store.get_conversation(&conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Normal);
        assert!(h.engine.live().is_empty());

        let next = h
            .engine
            .run_blocking(TurnRequest::new("chat", "u1", "again").with_conversation(&conversation_id))
            .await
            .unwrap();
        assert_eq!(next.answer, "Recovered.");
    }
}
