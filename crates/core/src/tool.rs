//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are invoked by the model through `<use-tool>` markup. Each tool
//! describes itself (name, label, parameters) so the registry can render the
//! tool-use rules block injected into the prompt.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use crate::error::{ToolError, panic_message};
use crate::turn::{TurnRequest, TurnResult};

/// Parsed parameters of one tool invocation.
pub type ToolParams = serde_json::Map<String, serde_json::Value>;

/// One declared parameter of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    /// Placeholder shown in the usage example; falls back to `description`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            brief: None,
            required: true,
        }
    }

    pub fn brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = Some(brief.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    Success,
    Failed,
}

impl ToolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// The outcome of resolving one round's output.
///
/// `output == true` means the round's text is the final answer and the loop stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Absent when the markup could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ToolParams>,
    pub state: ToolState,
    pub result: String,
    pub output: bool,
}

impl ToolCallRecord {
    /// The round is the final answer.
    pub fn final_answer(text: impl Into<String>) -> Self {
        Self {
            name: None,
            params: None,
            state: ToolState::Success,
            result: text.into(),
            output: true,
        }
    }

    /// A protocol failure reported back to the model.
    pub fn failed(name: Option<String>, result: impl Into<String>) -> Self {
        Self {
            name,
            params: None,
            state: ToolState::Failed,
            result: result.into(),
            output: false,
        }
    }
}

/// Runs a full sub-agent turn under the calling context.
///
/// The agent crate implements this so tools can delegate to another persona
/// without depending on the engine.
#[async_trait]
pub trait SubAgentRunner: Send + Sync {
    async fn run_sub_agent(&self, request: TurnRequest) -> crate::Result<TurnResult>;
}

/// What a tool handler can see of the turn that invoked it.
pub struct ToolContext<'a> {
    pub conversation_id: &'a str,
    pub message_id: &'a str,
    pub user_id: &'a str,
    pub query: &'a str,
    pub round: u32,
    pub runner: &'a dyn SubAgentRunner,
}

impl ToolContext<'_> {
    /// Run another agent as a child of the current request.
    pub async fn run_sub_agent(&self, request: TurnRequest) -> crate::Result<TurnResult> {
        self.runner.run_sub_agent(request).await
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool, also the markup tag the model emits.
    fn name(&self) -> &str;

    /// Short human-readable label, used in the usage example and node events.
    fn label(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    fn parameters(&self) -> Vec<ToolParameter>;

    /// Whether successful results are kept as tool-call memory.
    fn memory_enabled(&self) -> bool {
        true
    }

    /// How long a memory entry for this tool stays valid.
    fn memory_ttl(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    /// Execute the tool with the parsed parameters.
    async fn execute(&self, params: &ToolParams, ctx: &ToolContext<'_>) -> std::result::Result<String, ToolError>;

    /// Render this tool's section of the tool-use rules.
    fn to_prompt(&self) -> String {
        let params = self
            .parameters()
            .iter()
            .map(|p| {
                let req = if p.required { "" } else { " (optional)" };
                format!("- {}{}: {}", p.name, req, p.description)
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "### {name}\n\n**Description**:\n\n{description}\n\n**Parameters**:\n\n{params}\n\n**Usage**:\n\n{example}\n",
            name = self.name(),
            description = self.description(),
            example = self.to_example(),
        )
    }

    fn to_example(&self) -> String {
        let params = self
            .parameters()
            .iter()
            .map(|p| {
                let placeholder = p.brief.as_deref().unwrap_or(&p.description);
                format!("<{0}>{1}</{0}>", p.name, placeholder)
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "<use-tool label=\"{label}\">\n<{name}>\n{params}\n</{name}>\n</use-tool>",
            label = self.label(),
            name = self.name(),
        )
    }
}

/// A registry of available tools for one agent persona.
///
/// Cloning is cheap; tools are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Execute a tool by name.
    ///
    /// Never fails: a missing tool, a handler error or a handler panic becomes
    /// a failed record whose result tells the model what went wrong.
    pub async fn execute(&self, name: &str, params: ToolParams, ctx: &ToolContext<'_>) -> ToolCallRecord {
        let Some(tool) = self.tools.get(name) else {
            return ToolCallRecord::failed(Some(name.to_string()), format!("Tool not found: {name}"));
        };

        let outcome = AssertUnwindSafe(tool.execute(&params, ctx)).catch_unwind().await;
        let (state, result) = match outcome {
            Ok(Ok(result)) => (ToolState::Success, result),
            Ok(Err(e)) => (
                ToolState::Failed,
                format!("Tool {name} failed, reason: {}", reason(&e)),
            ),
            Err(panic) => (
                ToolState::Failed,
                format!("Tool {name} failed, reason: panicked: {}", panic_message(&*panic)),
            ),
        };

        ToolCallRecord {
            name: Some(name.to_string()),
            params: Some(params),
            state,
            result,
            output: false,
        }
    }

    /// Render the full tool-use rules block, with optional persona-specific guidance appended.
    pub fn to_prompt(&self, extra: &str) -> String {
        let tools = self
            .tools
            .values()
            .map(|t| t.to_prompt())
            .collect::<Vec<_>>()
            .join("\n");
        format!("<tool-use-rules>\n\n{TOOL_USE_RULES}\n\n## Tool list\n\n{tools}\n\n{TOOL_USE_GUIDE}\n\n{extra}\n\n</tool-use-rules>\n")
    }
}

fn reason(err: &ToolError) -> String {
    match err {
        ToolError::ExecutionFailed { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

const TOOL_USE_RULES: &str = r#"# Tool use

You may use one tool per message, and you will receive the result of that tool in the user's reply. Use tools step by step to accomplish the task, each use informed by the result of the previous one.

## Tool use format

Tool use is formatted with XML-style tags. The tool name is enclosed in opening and closing tags, and each parameter is enclosed in its own set of tags:

<use-tool label="label">
<tool-name>
<parameter1-name>value1</parameter1-name>
<parameter2-name>value2</parameter2-name>
...
</tool-name>
</use-tool>

Always follow this format so the call can be parsed and executed.

Requirements for the XML output:
- Return the XML exactly in the format above
- Do **not** add explanations or other text inside the XML
- Do **not** wrap the XML in a markdown code block

Example (using the `get-project-info-by-id` tool):

<use-tool label="Get project details">
<get-project-info-by-id>
<project-id>2</project-id>
</get-project-info-by-id>
</use-tool>

## Tool result format

Once a tool has run, a `<result>` block is added inside the original tool use XML:

<use-tool label="label">
<tool-name>
<parameter1-name>value1</parameter1-name>
</tool-name>
<result state="success|failed">
tool output
</result>
</use-tool>"#;

const TOOL_USE_GUIDE: &str = r#"## Tool use guidelines

0. Never use a tool that is not in the tool list.
1. Before writing the tool XML, assess what you already know and what you still need.
2. Pick the most suitable tool for the task from the descriptions above.
3. When several actions are needed, use one tool per message and build on the previous result. Never assume the outcome of a tool.
4. Build every call with the XML format specified for that tool.
5. After each use, the result tells you whether the tool succeeded and why it failed, if it did.
6. **Wait for the result of each tool use before continuing.** Never assume a tool succeeded without seeing its result."#;
