//! Agent personas.
//!
//! The set is closed: each persona supplies its system prompt, its user
//! prompt and a default round limit. Only `chat` uses tools.

use std::fmt;

use agentry_core::store::{ChatStore, StoreResult};
use agentry_core::tool::ToolRegistry;
use serde_json::Value;

use crate::context::RequestContext;
use crate::prompt;

/// Key of the raw retrieval results handed to the search personas.
pub const RAW_RESULTS_INPUT: &str = "raw_results";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Persona {
    Chat,
    KnowledgeSearch,
    WebSearch,
    AutoName,
    Suggest,
}

impl Persona {
    pub const ALL: [Persona; 5] = [
        Persona::Chat,
        Persona::KnowledgeSearch,
        Persona::WebSearch,
        Persona::AutoName,
        Persona::Suggest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::KnowledgeSearch => "knowledge-search",
            Self::WebSearch => "web-search",
            Self::AutoName => "auto-name",
            Self::Suggest => "suggest",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn default_max_round(&self) -> u32 {
        match self {
            Self::Chat => 5,
            _ => 1,
        }
    }

    pub fn system_prompt(&self, tools: &ToolRegistry) -> String {
        match self {
            Self::Chat => chat_system_prompt(tools),
            Self::KnowledgeSearch => search_system_prompt("knowledge base"),
            Self::WebSearch => search_system_prompt("web search"),
            Self::AutoName => AUTO_NAME_SYSTEM.to_string(),
            Self::Suggest => SUGGEST_SYSTEM.to_string(),
        }
    }

    pub async fn user_prompt(
        &self,
        store: &dyn ChatStore,
        ctx: &RequestContext,
        max_round: u32,
    ) -> StoreResult<String> {
        match self {
            Self::Chat => {
                let input = chat_input(&ctx.inputs());
                prompt::default_user_prompt(store, ctx, max_round, Some(input)).await
            }
            Self::KnowledgeSearch | Self::WebSearch => search_user_prompt(store, ctx).await,
            Self::AutoName => Ok(format!("The text provided by the user:\n\n{}", ctx.query())),
            Self::Suggest => {
                let inputs = ctx.inputs();
                Ok(format!(
                    "Conversation:\n<user>\n{}\n</user>\n\n<assistant>\n{}\n</assistant>",
                    text_input(&inputs, "user"),
                    text_input(&inputs, "assistant"),
                ))
            }
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn text_input(inputs: &serde_json::Map<String, Value>, key: &str) -> String {
    match inputs.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn chat_input(inputs: &serde_json::Map<String, Value>) -> String {
    let project = inputs
        .get("project_id")
        .and_then(Value::as_i64)
        .filter(|id| *id > 0)
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none".into());
    format!("<input>\n\nProject ID: {project}\n\n</input>")
}

/// One retrieval result as shown to a search persona.
fn search_result(title: &str, url: &str, content: &str) -> String {
    format!("<search-result title=\"{title}\" url=\"{url}\">\n{content}\n</search-result>")
}

fn raw_results(inputs: &serde_json::Map<String, Value>) -> String {
    let Some(Value::Array(items)) = inputs.get(RAW_RESULTS_INPUT) else {
        return String::new();
    };
    items
        .iter()
        .map(|item| {
            let field = |key| item.get(key).and_then(Value::as_str).unwrap_or_default();
            search_result(field("title"), field("url"), field("content"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn search_user_prompt(store: &dyn ChatStore, ctx: &RequestContext) -> StoreResult<String> {
    let mut conversation = String::new();
    if let Some(parent) = ctx.parent()
        && let Some(before) = parent.message_created_at()
    {
        conversation = prompt::history_messages(store, &parent.conversation_id(), before).await?;
    }
    conversation.push_str(&format!("\n<user>\n{}\n</user>", ctx.query()));

    Ok(format!(
        "<input>\n\nRaw search results:\n\n{}\n\nConversation with the user:\n\n{}\n\n</input>",
        raw_results(&ctx.inputs()),
        conversation,
    ))
}

fn chat_system_prompt(tools: &ToolRegistry) -> String {
    let tool_rules = if tools.is_empty() {
        String::new()
    } else {
        tools.to_prompt("")
    };
    format!("{CHAT_ROLE}\n\n{CHAT_LANGUAGE}\n\n{tool_rules}\n\n{CHAT_CAPABILITY}\n\n{CHAT_LOOP}\n\n{CHAT_INFO_RULES}\n\n{CHAT_ANSWER_RULES}")
}

fn search_system_prompt(source: &str) -> String {
    let example = [
        search_result("Try the inner-source assistant", "https://openx.example.com/dynamics/15128", "[details]"),
        search_result("Project owners: manage your knowledge base", "https://openx.example.com/activity/1885", "[details]"),
    ]
    .join("\n");
    format!(
        r#"<role>
You analyse {source} results. You are good at reading comprehension, filtering information and summarising it.
</role>

<todo>
You receive:
- a number of search results, in the XML format of `<search-result-example>` below
- the conversation with the user

Your task:
- work out from the conversation which topic the user currently cares about
- decide for every search result whether it relates to that topic, and drop all unrelated results
- for each related result, extract the parts of its content that relate to the topic as the new content
- keep the extracted information complete and accurate
- output the final result as XML
</todo>

<output-rules>
- Return your analysis strictly in the XML format below
- The XML must **not** contain any extra explanation or text
- Do **not** wrap the XML in a markdown code block
</output-rules>

<search-result-example>

{example}

</search-result-example>

<xml-generate-checklist>
Before writing the XML, check three things:
- tags: the number of <search-result> and </search-result> tags is equal
- quotes: the title and url attributes are both opened and closed with a double quote
- symbols: every opening tag ends with ">" and every closing tag has its "/"
</xml-generate-checklist>"#
    )
}

const CHAT_ROLE: &str = r#"<role>

# About the OpenX inner-source assistant

You are a professional inner-source question answering assistant, an AI agent built by the OpenX team.

## Goal

Answer users' questions about the OpenX inner-source platform and its projects by gathering information, performing tasks and giving guidance. Be a reliable partner for users who want to learn about inner-source projects or contribute to them.

## How to handle a task

1. Analyse the request to understand what is actually needed
2. Break complex problems into manageable steps
3. Use the right tools and methods for each step
4. Communicate clearly throughout
5. Present results in a useful, organised way

## Communication style

Be clear and concise and adapt to the user's preferences. Use technical terms where needed, and a more conversational tone where the situation calls for it.

## Values

- Accurate and reliable information
- Respect for user privacy and data
- Transparency about your own abilities and limits

</role>"#;

const CHAT_LANGUAGE: &str = r#"<language-settings>
- Default working language: the language of the user's message
- When the user explicitly asks for a language, use that language
- All reasoning and replies must use the working language
</language-settings>"#;

const CHAT_CAPABILITY: &str = r#"<system-capability>

- Analyse how a question relates to inner-source projects
- Query the data of inner-source projects
- Search the knowledge base of an inner-source project
- Search the web for more inner-source information
- Use the available tools step by step to answer questions or complete tasks

</system-capability>"#;

const CHAT_LOOP: &str = r#"<agent-loop>

You run in an agent loop and complete the task iteratively:
1. Decide whether the task relates to an inner-source project and determine the project ID:
  - Questions about inner source, the inner-source platform or OpenX are about the OpenX project, ID 2
  - When the input carries a project ID, decide whether the question relates to that project, and ask the user if unsure
  - When the project ID cannot be determined, search the inner-source projects first, then search the web for clues, then ask the user
2. With a known project ID, use `get-project-info-by-id` for project details
3. Use the search tools `get-knowledge` and `web-search` to find more material
4. When the task is done, reply with the result and wait for the next task

</agent-loop>"#;

const CHAT_INFO_RULES: &str = r#"<info-rules>

- Priority of information: user-provided > knowledge base > web search > your own knowledge
- Not every search result is relevant; filter them against the question before using them
- When a search result was used, give its title and address in the answer, e.g. "... see [title](url) for more"

</info-rules>"#;

const CHAT_ANSWER_RULES: &str = r#"<answer-rules>

**Asking the user:**
- Prefer using tools to get information over asking the user
- Only ask when every possibly useful tool has been tried and the task is still ambiguous or needs more detail
- When asking, you may offer a few options, each a string describing a possible answer

**Replying:**
- When you have the answer, state it clearly
- When the available information cannot answer the question, say so; never make up an answer

</answer-rules>"#;

const AUTO_NAME_SYSTEM: &str = r#"<role>
You are an expert title writer.
</role>

<todo>
Write a concise, fitting title for the text the user provides.
</todo>

<output-rules>
Output only the title and nothing else.
</output-rules>"#;

const SUGGEST_SYSTEM: &str = r#"<role>
You are a question answering assistant. After one exchange between the user and the system, infer which other questions the user is likely to be interested in.

Write 3 related questions. Each must be short and stay close to the user's current topic or likely needs.
</role>

<output-rules>
- Return the questions strictly as the JSON list shown below
- Output nothing but the JSON, with no explanation or other text
- Do **not** wrap the JSON in a markdown code block
</output-rules>

<output-example>

["Question 1", "Question 2", "Question 3"]

</output-example>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_core::message::{ConversationKind, NewConversation, NewMessage};
    use agentry_core::turn::TurnRequest;
    use agentry_store::InMemoryStore;
    use serde_json::json;

    #[test]
    fn names_round_trip() {
        for persona in Persona::ALL {
            assert_eq!(Persona::parse(persona.name()), Some(persona));
        }
        assert_eq!(Persona::parse("w3-search"), None);
        assert_eq!(Persona::Chat.default_max_round(), 5);
        assert_eq!(Persona::Suggest.default_max_round(), 1);
    }

    #[test]
    fn chat_input_shows_project_id() {
        let mut inputs = serde_json::Map::new();
        assert!(chat_input(&inputs).contains("Project ID: none"));
        inputs.insert("project_id".into(), json!(0));
        assert!(chat_input(&inputs).contains("Project ID: none"));
        inputs.insert("project_id".into(), json!(7));
        assert!(chat_input(&inputs).contains("Project ID: 7"));
    }

    #[test]
    fn chat_without_tools_has_no_tool_rules() {
        let prompt = Persona::Chat.system_prompt(&ToolRegistry::new());
        assert!(!prompt.contains("<tool-use-rules>"));
        assert!(prompt.contains("<agent-loop>"));
    }

    #[tokio::test]
    async fn suggest_prompt_uses_inputs() {
        let store = InMemoryStore::new();
        let request = TurnRequest::new("suggest", "u1", "")
            .with_input("user", "What is OpenX?")
            .with_input("assistant", "A platform.");
        let ctx = RequestContext::new(&request);
        let prompt = Persona::Suggest.user_prompt(&store, &ctx, 1).await.unwrap();
        assert_eq!(
            prompt,
            "Conversation:\n<user>\nWhat is OpenX?\n</user>\n\n<assistant>\nA platform.\n</assistant>"
        );
    }

    #[tokio::test]
    async fn search_prompt_includes_results_and_parent_history() {
        let store = InMemoryStore::new();
        let conv = store
            .create_conversation(NewConversation {
                user_id: "u1".into(),
                title: String::new(),
                kind: ConversationKind::Main,
            })
            .await
            .unwrap();
        store
            .create_message(NewMessage {
                conversation_id: conv.id.clone(),
                agent: "chat".into(),
                inputs: Default::default(),
                query: "earlier question".into(),
            })
            .await
            .unwrap();
        let current = store
            .create_message(NewMessage {
                conversation_id: conv.id.clone(),
                agent: "chat".into(),
                inputs: Default::default(),
                query: "current question".into(),
            })
            .await
            .unwrap();

        let parent = RequestContext::new(&TurnRequest::new("chat", "u1", "current question").with_conversation(&conv.id));
        parent.bind_conversation(&conv.id);
        parent.bind_message(&current.id, current.created_at);

        let request = TurnRequest::new("web-search", "u1", "members of OpenX").with_input(
            RAW_RESULTS_INPUT,
            json!([{"title": "Team", "url": "https://example.com/team", "content": "Alice and Bob"}]),
        );
        let child = RequestContext::new(&request);
        parent.register_child(&child);

        let prompt = Persona::WebSearch.user_prompt(&store, &child, 1).await.unwrap();
        assert!(prompt.contains("<search-result title=\"Team\" url=\"https://example.com/team\">\nAlice and Bob\n</search-result>"));
        assert!(prompt.contains("<user>\nearlier question\n</user>"));
        assert!(!prompt.contains("current question"));
        assert!(prompt.contains("<user>\nmembers of OpenX\n</user>"));
    }
}
