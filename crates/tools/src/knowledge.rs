//! `get-knowledge`: retrieve knowledge-base chunks of a project and let the
//! knowledge-search sub-agent condense them against the conversation.

use std::sync::Arc;

use agentry_core::error::ToolError;
use agentry_core::message::ConversationKind;
use agentry_core::tool::{Tool, ToolContext, ToolParameter, ToolParams};
use agentry_core::turn::TurnRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::http::HttpBackend;
use crate::project::project_id;

/// Number of chunks retrieved per query.
const TOP_K: usize = 5;
const SCORE_THRESHOLD: f64 = 0.4;

/// One retrieved chunk, in the shape the search personas read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub project_name: String,
    pub content: String,
}

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, project_id: i64, query: &str) -> Result<Vec<RetrievedChunk>, ToolError>;
}

pub struct HttpKnowledgeRetriever {
    http: HttpBackend,
}

impl HttpKnowledgeRetriever {
    pub fn new(http: HttpBackend) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    records: Vec<RetrievedChunk>,
}

#[async_trait]
impl KnowledgeRetriever for HttpKnowledgeRetriever {
    async fn retrieve(&self, project_id: i64, query: &str) -> Result<Vec<RetrievedChunk>, ToolError> {
        let body = json!({
            "query": query,
            "top_k": TOP_K,
            "score_threshold": SCORE_THRESHOLD,
        });
        let response: RetrieveResponse = self
            .http
            .post(&format!("/projects/{project_id}/retrieve"), &body)
            .await?;
        Ok(response.records)
    }
}

/// Fixed chunks per project, for tests and offline runs.
#[derive(Default)]
pub struct StaticKnowledgeRetriever {
    chunks: Vec<(i64, RetrievedChunk)>,
}

impl StaticKnowledgeRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(mut self, project_id: i64, chunk: RetrievedChunk) -> Self {
        self.chunks.push((project_id, chunk));
        self
    }
}

#[async_trait]
impl KnowledgeRetriever for StaticKnowledgeRetriever {
    async fn retrieve(&self, project_id: i64, query: &str) -> Result<Vec<RetrievedChunk>, ToolError> {
        let query = query.to_lowercase();
        Ok(self
            .chunks
            .iter()
            .filter(|(id, c)| *id == project_id && c.content.to_lowercase().contains(&query))
            .map(|(_, c)| c.clone())
            .take(TOP_K)
            .collect())
    }
}

pub struct GetKnowledgeTool {
    retriever: Arc<dyn KnowledgeRetriever>,
}

impl GetKnowledgeTool {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for GetKnowledgeTool {
    fn name(&self) -> &str {
        "get-knowledge"
    }

    fn label(&self) -> &str {
        "Query the knowledge base"
    }

    fn description(&self) -> &str {
        "Given a keyword, retrieve expert knowledge from the knowledge base of an inner-source project.\n\nUse one keyword per call rather than several keywords separated by spaces or commas. For several keywords, call this tool several times.\n\n<good_example>\ninner-source pipeline\n</good_example>\n\n<bad_example>\ninner-source pipeline build deploy\n</bad_example>"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::new("project-id", "ID of the inner-source project whose knowledge base is searched")
                .brief("project ID"),
            ToolParameter::new("query", "Knowledge-base search keyword").brief("search keyword"),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        let project_id = project_id(params)?;
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("query is required".into()))?;

        let chunks = self.retriever.retrieve(project_id, query).await?;
        debug!(project_id, query, chunks = chunks.len(), "Knowledge retrieved");

        let request = TurnRequest::new("knowledge-search", ctx.user_id, ctx.query)
            .with_kind(ConversationKind::Sub)
            .with_title("Tool call: get-knowledge")
            .with_input("raw_results", serde_json::to_value(&chunks).unwrap_or_default());
        let result = ctx.run_sub_agent(request).await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })?;
        Ok(result.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingRunner, tool_context};

    fn chunk(content: &str) -> RetrievedChunk {
        RetrievedChunk {
            title: "Pipeline guide".into(),
            url: "https://example.com/guide".into(),
            project_name: "Pipeline".into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn delegates_chunks_to_sub_agent() {
        let retriever = StaticKnowledgeRetriever::new()
            .with_chunk(7, chunk("The pipeline builds every commit"))
            .with_chunk(8, chunk("Another project's pipeline"));
        let tool = GetKnowledgeTool::new(Arc::new(retriever));
        let runner = RecordingRunner::answering("condensed");

        let mut params = ToolParams::new();
        params.insert("project-id".into(), 7.into());
        params.insert("query".into(), "pipeline".into());
        let out = tool.execute(&params, &tool_context(&runner)).await.unwrap();
        assert_eq!(out, "condensed");

        let request = runner.last_request().unwrap();
        assert_eq!(request.agent, "knowledge-search");
        assert_eq!(request.kind, ConversationKind::Sub);
        assert_eq!(request.query, "user question");
        let raw = request.inputs["raw_results"].as_array().unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0]["content"], "The pipeline builds every commit");
    }

    #[tokio::test]
    async fn sub_agent_failure_is_a_tool_failure() {
        let tool = GetKnowledgeTool::new(Arc::new(StaticKnowledgeRetriever::new()));
        let runner = RecordingRunner::failing();

        let mut params = ToolParams::new();
        params.insert("project-id".into(), 7.into());
        params.insert("query".into(), "pipeline".into());
        let err = tool.execute(&params, &tool_context(&runner)).await.unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }
}
