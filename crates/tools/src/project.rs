//! Project lookup tools: `get-project-info-by-id` and `search-project-by-keyword`.

use std::sync::Arc;

use agentry_core::error::ToolError;
use agentry_core::tool::{Tool, ToolContext, ToolParameter, ToolParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::HttpBackend;

/// The OpenX platform project; questions about inner source in general are about it.
pub const OPENX_PROJECT_ID: i64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDetail {
    pub id: i64,
    pub project_name: String,
    #[serde(default)]
    pub project_introduction: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub codehub_url: String,
    #[serde(default)]
    pub project_primary_owner_name: String,
    /// Comma-separated `id(name)` of the project's chat groups.
    #[serde(default)]
    pub welink_groups: String,
    #[serde(default)]
    pub inner_source_grade: f64,
    /// Fields passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectGroup {
    pub group_id: String,
    pub group_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: i64,
    pub name: String,
    pub introduction: String,
}

/// Where project data comes from.
#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn project(&self, id: i64) -> Result<ProjectDetail, ToolError>;

    async fn groups(&self, id: i64) -> Result<Vec<ProjectGroup>, ToolError>;

    /// Inner-source grade; `None` when the project has not been graded.
    async fn grade(&self, id: i64) -> Result<Option<f64>, ToolError>;

    async fn search(&self, keyword: &str) -> Result<Vec<ProjectSummary>, ToolError>;
}

/// Project catalog served over HTTP.
pub struct HttpProjectCatalog {
    http: HttpBackend,
}

impl HttpProjectCatalog {
    pub fn new(http: HttpBackend) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GradeResponse {
    #[serde(default)]
    inner_source_grade: Option<f64>,
}

#[async_trait]
impl ProjectCatalog for HttpProjectCatalog {
    async fn project(&self, id: i64) -> Result<ProjectDetail, ToolError> {
        self.http.get(&format!("/projects/{id}"), &[]).await
    }

    async fn groups(&self, id: i64) -> Result<Vec<ProjectGroup>, ToolError> {
        self.http.get(&format!("/projects/{id}/groups"), &[]).await
    }

    async fn grade(&self, id: i64) -> Result<Option<f64>, ToolError> {
        let grade: Option<GradeResponse> = self.http.get(&format!("/projects/{id}/grade"), &[]).await?;
        Ok(grade.and_then(|g| g.inner_source_grade))
    }

    async fn search(&self, keyword: &str) -> Result<Vec<ProjectSummary>, ToolError> {
        self.http
            .get(
                "/projects/search",
                &[("keyword", keyword.to_string()), ("page_size", "10".to_string())],
            )
            .await
    }
}

/// In-memory catalog, for tests and offline runs.
#[derive(Default)]
pub struct StaticProjectCatalog {
    projects: Vec<(ProjectDetail, Vec<ProjectGroup>, Option<f64>)>,
}

impl StaticProjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, detail: ProjectDetail, groups: Vec<ProjectGroup>, grade: Option<f64>) -> Self {
        self.projects.push((detail, groups, grade));
        self
    }

    fn find(&self, id: i64) -> Result<&(ProjectDetail, Vec<ProjectGroup>, Option<f64>), ToolError> {
        self.projects
            .iter()
            .find(|(p, _, _)| p.id == id)
            .ok_or_else(|| ToolError::Upstream(format!("project {id} not found")))
    }
}

#[async_trait]
impl ProjectCatalog for StaticProjectCatalog {
    async fn project(&self, id: i64) -> Result<ProjectDetail, ToolError> {
        self.find(id).map(|(p, _, _)| p.clone())
    }

    async fn groups(&self, id: i64) -> Result<Vec<ProjectGroup>, ToolError> {
        self.find(id).map(|(_, g, _)| g.clone())
    }

    async fn grade(&self, id: i64) -> Result<Option<f64>, ToolError> {
        self.find(id).map(|(_, _, grade)| *grade)
    }

    async fn search(&self, keyword: &str) -> Result<Vec<ProjectSummary>, ToolError> {
        let keyword = keyword.to_lowercase();
        Ok(self
            .projects
            .iter()
            .filter(|(p, _, _)| {
                p.project_name.to_lowercase().contains(&keyword)
                    || p.project_introduction.to_lowercase().contains(&keyword)
            })
            .map(|(p, _, _)| ProjectSummary {
                id: p.id,
                name: p.project_name.clone(),
                introduction: p.project_introduction.clone(),
            })
            .collect())
    }
}

/// Read `project-id` as an integer; the model may send it as text.
pub(crate) fn project_id(params: &ToolParams) -> Result<i64, ToolError> {
    match params.get("project-id") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ToolError::InvalidArguments("project-id must be a project number".into()))
}

pub struct GetProjectInfoTool {
    catalog: Arc<dyn ProjectCatalog>,
}

impl GetProjectInfoTool {
    pub fn new(catalog: Arc<dyn ProjectCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for GetProjectInfoTool {
    fn name(&self) -> &str {
        "get-project-info-by-id"
    }

    fn label(&self) -> &str {
        "Get project details"
    }

    fn description(&self) -> &str {
        "Get the details of an inner-source project by its ID: name, introduction, owner, repository address, chat groups and inner-source grade. The result is a JSON object with the fields id, projectName, projectIntroduction, url, codehubUrl, projectPrimaryOwnerName, welinkGroups and innerSourceGrade, plus any other fields the catalog provides."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::new("project-id", "ID of the inner-source project to look up").brief("project ID")]
    }

    async fn execute(&self, params: &ToolParams, _ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        let id = project_id(params)?;
        let mut detail = self.catalog.project(id).await?;
        let (groups, grade) = tokio::try_join!(self.catalog.groups(detail.id), self.catalog.grade(detail.id))?;

        detail.welink_groups = groups
            .iter()
            .map(|g| format!("{}({})", g.group_id, g.group_name))
            .collect::<Vec<_>>()
            .join(",");
        detail.inner_source_grade = grade.unwrap_or(0.0);

        serde_json::to_string(&detail).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })
    }
}

pub struct SearchProjectTool {
    catalog: Arc<dyn ProjectCatalog>,
}

impl SearchProjectTool {
    pub fn new(catalog: Arc<dyn ProjectCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for SearchProjectTool {
    fn name(&self) -> &str {
        "search-project-by-keyword"
    }

    fn label(&self) -> &str {
        "Search projects"
    }

    fn description(&self) -> &str {
        "Infer a project name from the user's question and search the inner-source projects with it to find the project ID. The result is a JSON list of {id, name, introduction}. When several projects match, ask the user which one the question is about."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::new("keyword", "Project name inferred from the user's question").brief("project name")]
    }

    async fn execute(&self, params: &ToolParams, _ctx: &ToolContext<'_>) -> Result<String, ToolError> {
        let keyword = params
            .get("keyword")
            .and_then(Value::as_str)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("keyword is required".into()))?;

        let mut results = self.catalog.search(keyword.trim()).await?;
        results.insert(
            0,
            ProjectSummary {
                id: 0,
                name: "Not an inner-source question".into(),
                introduction: "The question is unrelated to inner source, OpenX, the inner-source platform or any inner-source project".into(),
            },
        );
        if !results.iter().any(|p| p.id == OPENX_PROJECT_ID) {
            results.insert(
                0,
                ProjectSummary {
                    id: OPENX_PROJECT_ID,
                    name: "OpenX".into(),
                    introduction: "OpenX, the company's inner-source platform and the official portal of its inner-source projects and communities".into(),
                },
            );
        }

        serde_json::to_string(&results).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })
    }
}
