//! Sub-agent runners and tool contexts for tool tests.

use std::sync::Mutex;

use agentry_core::message::MessageState;
use agentry_core::tool::{SubAgentRunner, ToolContext};
use agentry_core::turn::{TurnRequest, TurnResult};
use async_trait::async_trait;

pub struct NoRunner;

#[async_trait]
impl SubAgentRunner for NoRunner {
    async fn run_sub_agent(&self, request: TurnRequest) -> agentry_core::Result<TurnResult> {
        Err(agentry_core::Error::Internal(format!("no runner for {}", request.agent)))
    }
}

/// Records every sub-agent request and answers with a fixed text.
pub struct RecordingRunner {
    answer: Option<String>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl RecordingRunner {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> Option<TurnRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SubAgentRunner for RecordingRunner {
    async fn run_sub_agent(&self, request: TurnRequest) -> agentry_core::Result<TurnResult> {
        self.requests.lock().unwrap().push(request);
        let answer = self
            .answer
            .clone()
            .ok_or_else(|| agentry_core::Error::Internal("sub-agent failed".into()))?;
        Ok(TurnResult {
            conversation_id: "sub-c".into(),
            message_id: "sub-m".into(),
            answer,
            status: MessageState::Success,
            rounds: 1,
            tool_calls: vec![],
        })
    }
}

pub fn tool_context(runner: &dyn SubAgentRunner) -> ToolContext<'_> {
    ToolContext {
        conversation_id: "c1",
        message_id: "m1",
        user_id: "u1",
        query: "user question",
        round: 1,
        runner,
    }
}
