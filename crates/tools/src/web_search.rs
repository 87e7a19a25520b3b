//! `web-search`: search the web, merge the hits per page address and let the
//! web-search sub-agent filter them against the conversation.

use std::collections::HashMap;
use std::sync::Arc;

use agentry_core::error::ToolError;
use agentry_core::message::ConversationKind;
use agentry_core::tool::{Tool, ToolContext, ToolParameter, ToolParams};
use agentry_core::turn::TurnRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::http::HttpBackend;

/// Result pages fetched per search.
const SEARCH_PAGES: u32 = 3;
/// Characters of content kept per result.
const MAX_CONTENT_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    /// Matching fragment; may carry `<em>` highlight tags.
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub title: String,
    pub url: String,
    pub content: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// One page of hits, `page` starting at 1.
    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchHit>, ToolError>;
}

pub struct HttpSearchBackend {
    http: HttpBackend,
}

impl HttpSearchBackend {
    pub fn new(http: HttpBackend) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchHit>, ToolError> {
        self.http
            .get("/search", &[("q", query.to_string()), ("page", page.to_string())])
            .await
    }
}

/// Serves the same hits for every query, one page only.
#[derive(Default)]
pub struct StaticSearchBackend {
    hits: Vec<SearchHit>,
}

impl StaticSearchBackend {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self { hits }
    }
}

#[async_trait]
impl SearchBackend for StaticSearchBackend {
    async fn search(&self, _query: &str, page: u32) -> Result<Vec<SearchHit>, ToolError> {
        Ok(if page == 1 { self.hits.clone() } else { Vec::new() })
    }
}

fn strip_highlight(text: &str) -> String {
    text.replace("<em>", "").replace("</em>", "")
}

fn truncate_chars(text: &mut String, max: usize) {
    if let Some((index, _)) = text.char_indices().nth(max) {
        text.truncate(index);
    }
}

/// Merge hits that point at the same address, keeping first-seen order.
pub fn merge_hits(hits: impl IntoIterator<Item = SearchHit>) -> Vec<SearchDocument> {
    let mut documents: Vec<SearchDocument> = Vec::new();
    let mut by_url: HashMap<String, usize> = HashMap::new();

    for hit in hits {
        let snippet = strip_highlight(&hit.snippet);
        match by_url.get(&hit.url) {
            Some(&index) => {
                let document = &mut documents[index];
                document.content.push('\n');
                document.content.push_str(&snippet);
                truncate_chars(&mut document.content, MAX_CONTENT_CHARS);
            }
            None => {
                let mut content = snippet;
                truncate_chars(&mut content, MAX_CONTENT_CHARS);
                by_url.insert(hit.url.clone(), documents.len());
                documents.push(SearchDocument {
                    title: strip_highlight(&hit.title),
                    url: hit.url,
                    content,
                });
            }
        }
    }
    documents
}

pub struct WebSearchTool {
    backend: Arc<dyn SearchBackend>,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web-search"
    }

    fn label(&self) -> &str {
        "Web search"
    }

    fn description(&self) -> &str {
        "Given keywords, search the web for more information related to the question.\n\nSeveral keywords may be used in one call, separated by spaces."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::new("query", "Search keywords, at least 2 characters").brief("search keywords")]
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        let query = params
            .get("query")
            .map(|q| match q {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .ok_or_else(|| ToolError::InvalidArguments("query is required".into()))?;
        if query.chars().count() < 2 {
            return Ok(String::new());
        }

        let mut hits = Vec::new();
        for page in 1..=SEARCH_PAGES {
            let page_hits = self.backend.search(&query, page).await?;
            if page_hits.is_empty() {
                break;
            }
            hits.extend(page_hits);
        }
        let documents = merge_hits(hits);
        debug!(query = %query, documents = documents.len(), "Web search finished");

        let request = TurnRequest::new("web-search", ctx.user_id, ctx.query)
            .with_kind(ConversationKind::Sub)
            .with_title("Tool call: web-search")
            .with_input("raw_results", serde_json::to_value(&documents).unwrap_or_default());
        let result = ctx.run_sub_agent(request).await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })?;
        Ok(result.answer)
    }
}
