//! Built-in tools for Agentry.
//!
//! Each tool talks to its data source through a backend trait with an HTTP
//! implementation and a static one for tests and offline runs:
//!
//! - `get-project-info-by-id`, `search-project-by-keyword` → [`ProjectCatalog`]
//! - `get-knowledge` → [`KnowledgeRetriever`], then the `knowledge-search` sub-agent
//! - `web-search` → [`SearchBackend`], then the `web-search` sub-agent

pub mod http;
pub mod knowledge;
pub mod project;
pub mod web_search;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use agentry_config::ToolsConfig;
use agentry_core::tool::Tool;
use tracing::info;

pub use http::HttpBackend;
pub use knowledge::{GetKnowledgeTool, HttpKnowledgeRetriever, KnowledgeRetriever, RetrievedChunk, StaticKnowledgeRetriever};
pub use project::{
    GetProjectInfoTool, HttpProjectCatalog, ProjectCatalog, ProjectDetail, ProjectGroup, ProjectSummary,
    SearchProjectTool, StaticProjectCatalog,
};
pub use web_search::{HttpSearchBackend, SearchBackend, SearchHit, StaticSearchBackend, WebSearchTool};

/// Tools for the chat persona, one per configured backend.
///
/// A tool whose backend URL is not configured is left out.
pub fn default_tools(config: &ToolsConfig) -> Vec<Arc<dyn Tool>> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let backend = |url: &str| HttpBackend::new(url, config.api_token.clone(), timeout);
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();

    if let Some(url) = &config.project_api_url {
        let catalog: Arc<dyn ProjectCatalog> = Arc::new(HttpProjectCatalog::new(backend(url)));
        tools.push(Arc::new(SearchProjectTool::new(catalog.clone())));
        tools.push(Arc::new(GetProjectInfoTool::new(catalog)));
    }
    if let Some(url) = &config.knowledge_api_url {
        tools.push(Arc::new(GetKnowledgeTool::new(Arc::new(HttpKnowledgeRetriever::new(backend(url))))));
    }
    if let Some(url) = &config.search_api_url {
        tools.push(Arc::new(WebSearchTool::new(Arc::new(HttpSearchBackend::new(backend(url))))));
    }

    info!(
        tools = ?tools.iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
        "Built-in tools configured"
    );
    tools
}
