//! End-to-end integration tests for the Agentry engine.
//!
//! These tests run whole turns through the engine with the built-in tools on
//! static backends: tool markup, sub-agent delegation, tool-call memory on a
//! SQLite store, and the HTTP gateway's SSE stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agentry_agent::Engine;
use agentry_config::AppConfig;
use agentry_core::error::ProviderError;
use agentry_core::event::EventBus;
use agentry_core::message::Message;
use agentry_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use agentry_core::store::ChatStore;
use agentry_core::tool::ToolState;
use agentry_core::turn::TurnRequest;
use agentry_providers::router::ProviderRouter;
use agentry_store::{InMemoryStore, SqliteStore};
use agentry_tools::knowledge::{GetKnowledgeTool, RetrievedChunk, StaticKnowledgeRetriever};
use agentry_tools::project::{ProjectDetail, SearchProjectTool, StaticProjectCatalog};

// ── Mock Provider ────────────────────────────────────────────────────────

/// A mock provider that returns scripted answers in sequence and records every request.
struct ScriptedProvider {
    answers: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn user_prompt(&self, index: usize) -> String {
        self.requests.lock().unwrap()[index]
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let answer = self.answers.lock().unwrap().pop_front().ok_or(ProviderError::ApiError {
            status_code: 500,
            message: "scripted provider exhausted".into(),
        })?;
        Ok(ProviderResponse {
            message: Message::assistant(answer),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model,
        })
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

const KNOWLEDGE_CALL: &str = "Let me look that up.\n<use-tool label=\"Query the knowledge base\">\n<get-knowledge>\n<project-id>7</project-id>\n<query>pipeline</query>\n</get-knowledge>\n</use-tool>";

const SEARCH_CALL: &str = "<use-tool>\n<search-project-by-keyword>\n<keyword>pipeline</keyword>\n</search-project-by-keyword>\n</use-tool>";

fn engine_with(provider: Arc<ScriptedProvider>, store: Arc<dyn ChatStore>) -> Engine {
    let mut config = AppConfig::default();
    config.default_provider = "e2e".into();
    let mut router = ProviderRouter::new("e2e");
    router.register("e2e", provider);
    let engine = Engine::new(config, router, store, Arc::new(EventBus::default()));

    let retriever = StaticKnowledgeRetriever::new().with_chunk(
        7,
        RetrievedChunk {
            title: "Pipeline guide".into(),
            url: "https://example.com/pipeline".into(),
            project_name: "Pipeline".into(),
            content: "The pipeline triggers a build on each commit".into(),
        },
    );
    let catalog = StaticProjectCatalog::new().with_project(
        ProjectDetail {
            id: 7,
            project_name: "Pipeline".into(),
            project_introduction: "Build and deploy pipelines".into(),
            url: String::new(),
            codehub_url: String::new(),
            project_primary_owner_name: "ana".into(),
            welink_groups: String::new(),
            inner_source_grade: 0.0,
            extra: serde_json::Map::new(),
        },
        vec![],
        Some(3.0),
    );
    engine
        .register_tool("chat", Arc::new(GetKnowledgeTool::new(Arc::new(retriever))))
        .unwrap();
    engine
        .register_tool("chat", Arc::new(SearchProjectTool::new(Arc::new(catalog))))
        .unwrap();
    engine
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn knowledge_question_runs_sub_agent() {
    let provider = ScriptedProvider::new(&[
        KNOWLEDGE_CALL,
        "Each commit is built by the pipeline.",
        "The pipeline builds every commit.",
    ]);
    let engine = engine_with(provider.clone(), Arc::new(InMemoryStore::new()));

    let result = engine
        .run_blocking(TurnRequest::new("chat", "u1", "How does the pipeline work?"))
        .await
        .unwrap();

    assert_eq!(result.answer, "The pipeline builds every commit.");
    assert_eq!(result.rounds, 2);
    assert_eq!(provider.calls(), 3);

    let call = &result.tool_calls[0];
    assert_eq!(call.name.as_deref(), Some("get-knowledge"));
    assert_eq!(call.state, ToolState::Success);
    assert_eq!(call.result, "Each commit is built by the pipeline.");

    // The sub-agent sees the retrieved chunk, the chat's second round sees the sub-agent's answer.
    assert!(provider.user_prompt(1).contains("The pipeline triggers a build on each commit"));
    assert!(provider.user_prompt(2).contains("Each commit is built by the pipeline."));
    assert!(provider.user_prompt(2).contains("<current-tool-use>"));
}

#[tokio::test]
async fn tool_memory_survives_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agentry.db");
    let path = path.to_string_lossy().to_string();

    let first = ScriptedProvider::new(&[SEARCH_CALL, "Project 7 is Pipeline."]);
    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::new(&path).await.unwrap());
    let engine = engine_with(first.clone(), store);
    let result = engine
        .run_blocking(TurnRequest::new("chat", "u1", "Which project builds pipelines?"))
        .await
        .unwrap();
    assert_eq!(result.tool_calls[0].name.as_deref(), Some("search-project-by-keyword"));
    let conversation_id = result.conversation_id;
    drop(engine);

    let second = ScriptedProvider::new(&["Still project 7."]);
    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::new(&path).await.unwrap());
    let engine = engine_with(second.clone(), store);
    let result = engine
        .run_blocking(TurnRequest::new("chat", "u1", "And its owner?").with_conversation(&conversation_id))
        .await
        .unwrap();
    assert_eq!(result.answer, "Still project 7.");

    let prompt = second.user_prompt(0);
    assert!(prompt.contains("<history-tool-use>"));
    assert!(prompt.contains("search-project-by-keyword"));
    assert!(prompt.contains("Which project builds pipelines?"));

    let page = engine.history(&conversation_id, "u1", None, None).await.unwrap();
    assert_eq!(page.data.len(), 2);
    assert!(!page.has_more);
}

#[tokio::test]
async fn gateway_streams_tool_events() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let provider = ScriptedProvider::new(&[
        KNOWLEDGE_CALL,
        "Each commit is built by the pipeline.",
        "The pipeline builds every commit.",
    ]);
    let engine = engine_with(provider, Arc::new(InMemoryStore::new()));
    let app = agentry_gateway::build_router(engine);

    let body = serde_json::json!({
        "query": "How does the pipeline work?",
        "user": "u1",
        "response_mode": "streaming",
    });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat-messages")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let sse = String::from_utf8(bytes.to_vec()).unwrap();

    let node_started = sse.find("event: node_started").unwrap();
    let node_finished = sse.find("event: node_finished").unwrap();
    let replaced = sse.find("event: message_replace").unwrap();
    let finished = sse.find("event: workflow_finished").unwrap();
    assert!(node_started < node_finished);
    assert!(node_finished < finished);
    assert!(replaced < finished);
    assert!(sse.contains("\"node_id\":\"get-knowledge\""));
    assert!(sse.contains("The pipeline builds every commit."));
    assert!(sse.contains("\"status\":\"succeeded\""));
    assert!(!sse.contains("event: error"));
}
