//! The agent execution engine.
//!
//! A turn runs a **prompt → complete → resolve** cycle:
//!
//! 1. **Build prompts** for the persona (system rules, history, remembered
//!    tool calls, inputs, the query and this turn's tool-use log)
//! 2. **Stream a completion** from the configured provider
//! 3. **Resolve** the output: a `<use-tool>` block runs one tool and its
//!    result is spliced back in for the next round; anything else is the answer
//!
//! The loop ends with an answer, at the round limit, on error, or when the
//! turn is stopped. Stopping a turn stops every sub-agent it started.

pub mod agent;
pub mod context;
pub mod engine;
pub mod invoker;
pub mod live;
pub mod persona;
pub mod prompt;
pub mod protocol;
pub mod stream_event;
pub mod token;

#[cfg(test)]
mod test_helpers;

pub use agent::Agent;
pub use context::RequestContext;
pub use engine::{ChildRunner, Engine, FeedbackSummary, HistoryItem, HistoryPage, RenameMode, TurnStream};
pub use invoker::{CompletionInvoker, ModelProfile};
pub use live::LiveContexts;
pub use persona::Persona;
pub use stream_event::{EventPayload, NodeData, RunStatus, StreamEvent, WorkflowData};
