//! The orchestration loop.
//!
//! One turn runs rounds until the model answers without a tool call or the
//! round limit is reached:
//!
//! ```text
//! round += 1
//!   (round 1) acquire or create the conversation, create or resume the message
//!   build system + user prompts (concurrently)
//!   stream the completion into the round text
//!   resolve the round: final answer → persist, done
//!                      tool call    → run it, splice the result, persist the
//!                                     process log, remember it, next round
//! ```
//!
//! Every step checks that the context is still running, so a stop request
//! takes effect at the next step boundary even if it lands between rounds.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use agentry_core::error::{Error, Result, StoreError, TurnError, panic_message};
use agentry_core::event::DomainEvent;
use agentry_core::message::{ConversationStatus, MessageState, MessageUpdate, NewConversation, NewMessage};
use agentry_core::tool::{ToolCallRecord, ToolRegistry, ToolState};
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, trace, warn};

use crate::context::RequestContext;
use crate::engine::{ChildRunner, Engine};
use crate::invoker::CompletionInvoker;
use crate::persona::Persona;
use crate::protocol::{self, CLOSING_TAG};
use crate::stream_event::{EventPayload, RunStatus, WorkflowData};

/// A persona bound to a model, its tools and its round limit.
pub struct Agent {
    persona: Persona,
    tools: ToolRegistry,
    max_round: u32,
    invoker: CompletionInvoker,
}

impl Agent {
    pub fn new(persona: Persona, tools: ToolRegistry, max_round: u32, invoker: CompletionInvoker) -> Self {
        Self {
            persona,
            tools,
            max_round: max_round.max(1),
            invoker,
        }
    }

    pub fn persona(&self) -> Persona {
        self.persona
    }

    pub fn max_round(&self) -> u32 {
        self.max_round
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run a whole turn and report its outcome on the context's output.
    ///
    /// Does not clean up; the caller does that once the turn is over,
    /// whatever the outcome. A panic inside the loop fails the turn instead
    /// of unwinding past that cleanup.
    pub async fn run(&self, engine: &Engine, ctx: &Arc<RequestContext>) -> Result<String> {
        let outcome = AssertUnwindSafe(self.process(engine, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Internal(format!("turn panicked: {}", panic_message(&*panic)))));
        match outcome {
            Ok(answer) => {
                ctx.emit(EventPayload::WorkflowFinished {
                    data: WorkflowData {
                        status: RunStatus::Succeeded,
                    },
                });
                engine.events().publish(DomainEvent::TurnFinished {
                    conversation_id: ctx.conversation_id(),
                    message_id: ctx.message_id(),
                    status: MessageState::Success,
                    rounds: ctx.round(),
                    timestamp: Utc::now(),
                });
                info!(
                    agent = %self.persona,
                    message_id = %ctx.message_id(),
                    rounds = ctx.round(),
                    "Turn succeeded"
                );
                Ok(answer)
            }
            Err(e) => {
                self.process_error(engine, ctx, &e).await;
                Err(e)
            }
        }
    }

    async fn process(&self, engine: &Engine, ctx: &Arc<RequestContext>) -> Result<String> {
        loop {
            let round = ctx.next_round();
            debug!(agent = %self.persona, round, max_round = self.max_round, "Starting round");

            if round == 1 {
                self.init_conversation(engine, ctx).await?;
                self.init_message(engine, ctx).await?;
            }

            let (system, user) = tokio::try_join!(self.system_prompt(ctx), self.user_prompt(engine, ctx))?;
            trace!(agent = %self.persona, round, %system, %user, "Prompts built");

            self.complete(ctx, &system, &user).await?;
            ctx.ensure_running()?;

            let runner = ChildRunner::new(engine.clone(), ctx.clone());
            let record =
                protocol::resolve_tool_call(ctx, &self.tools, self.max_round, &runner, engine.events()).await;
            ctx.ensure_running()?;

            if record.output {
                return self.finish(engine, ctx).await;
            }
            self.commit_tool_round(engine, ctx, &record).await?;
        }
    }

    /// Create the conversation, or take the busy lock of an existing one.
    async fn init_conversation(&self, engine: &Engine, ctx: &RequestContext) -> Result<()> {
        ctx.ensure_running()?;
        let store = engine.store();

        let conversation_id = if ctx.is_first_message() {
            let conversation = store
                .create_conversation(NewConversation {
                    user_id: ctx.user_id().to_string(),
                    title: ctx.title().to_string(),
                    kind: ctx.kind(),
                })
                .await?;
            debug!(conversation_id = %conversation.id, kind = ctx.kind().as_str(), "Created conversation");
            conversation.id
        } else {
            let id = ctx.conversation_id();
            let conversation = store.get_conversation(&id).await?.ok_or_else(|| StoreError::NotFound {
                kind: "conversation",
                id: id.clone(),
            })?;
            if conversation.user_id != ctx.user_id() {
                return Err(TurnError::Forbidden(format!("conversation {id}")).into());
            }
            match conversation.status {
                ConversationStatus::Disabled => return Err(TurnError::ConversationDisabled(id).into()),
                ConversationStatus::Busy => return Err(TurnError::ConversationBusy(id).into()),
                ConversationStatus::Normal => {}
            }
            if !store
                .transition_conversation(&id, ConversationStatus::Normal, ConversationStatus::Busy)
                .await?
            {
                return Err(TurnError::ConversationBusy(id).into());
            }
            id
        };

        ctx.bind_conversation(&conversation_id);
        Ok(())
    }

    /// Create the message, or resume the one being regenerated.
    async fn init_message(&self, engine: &Engine, ctx: &Arc<RequestContext>) -> Result<()> {
        ctx.ensure_running()?;
        let store = engine.store();
        let conversation_id = ctx.conversation_id();

        let existing = match ctx.requested_message() {
            Some(id) => Some(store.get_message(id).await?.ok_or_else(|| StoreError::NotFound {
                kind: "message",
                id: id.to_string(),
            })?),
            None => None,
        };

        let (message_id, created_at) = match existing {
            Some(message) => {
                if message.conversation_id != conversation_id {
                    return Err(TurnError::Forbidden(format!("message {}", message.id)).into());
                }
                ctx.replay(message.query, message.inputs);
                store
                    .update_message(
                        &message.id,
                        MessageUpdate {
                            process: Some(String::new()),
                            answer: Some(String::new()),
                            status: Some(MessageState::Running),
                        },
                    )
                    .await?;
                debug!(message_id = %message.id, "Regenerating message");
                (message.id, message.created_at)
            }
            None => {
                let message = store
                    .create_message(NewMessage {
                        conversation_id: conversation_id.clone(),
                        agent: self.persona.name().to_string(),
                        inputs: ctx.inputs(),
                        query: ctx.query(),
                    })
                    .await?;
                (message.id, message.created_at)
            }
        };

        ctx.bind_message(&message_id, created_at);
        engine.live().insert(&message_id, ctx.clone());

        engine.events().publish(DomainEvent::TurnStarted {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            agent: self.persona.name().to_string(),
            timestamp: Utc::now(),
        });
        ctx.emit(EventPayload::WorkflowStarted);
        info!(
            agent = %self.persona,
            conversation_id = %conversation_id,
            message_id = %message_id,
            "Turn started"
        );
        Ok(())
    }

    async fn system_prompt(&self, ctx: &RequestContext) -> Result<String> {
        ctx.ensure_running()?;
        Ok(self.persona.system_prompt(&self.tools))
    }

    async fn user_prompt(&self, engine: &Engine, ctx: &RequestContext) -> Result<String> {
        ctx.ensure_running()?;
        Ok(self.persona.user_prompt(engine.store(), ctx, self.max_round).await?)
    }

    async fn complete(&self, ctx: &RequestContext, system: &str, user: &str) -> Result<()> {
        ctx.ensure_running()?;
        self.invoker
            .complete(system, user, ctx.cancel_token(), |text| {
                ctx.append_round_text(text);
                ctx.emit(EventPayload::Message {
                    answer: text.to_string(),
                });
            })
            .await?;
        trace!(agent = %self.persona, output = %ctx.round_text(), "Completion received");
        Ok(())
    }

    /// Splice the tool result into the round, persist the process log and
    /// remember a successful call.
    async fn commit_tool_round(&self, engine: &Engine, ctx: &RequestContext, record: &ToolCallRecord) -> Result<()> {
        let block = protocol::result_block(record);
        if let Some(spliced) = protocol::splice_result(&ctx.round_text(), &block) {
            ctx.emit(EventPayload::MessageReplace {
                answer_replace: CLOSING_TAG.to_string(),
                answer: format!("{block}\n{CLOSING_TAG}"),
            });
            ctx.set_round_text(spliced);
        }

        let process = ctx.commit_round();
        engine
            .store()
            .update_message(
                &ctx.message_id(),
                MessageUpdate {
                    process: Some(process),
                    ..Default::default()
                },
            )
            .await?;

        if record.state == ToolState::Success {
            protocol::save_tool_call_memory(ctx, &self.tools, engine.store()).await?;
        }
        Ok(())
    }

    async fn finish(&self, engine: &Engine, ctx: &RequestContext) -> Result<String> {
        let answer = ctx.round_text();
        engine
            .store()
            .update_message(
                &ctx.message_id(),
                MessageUpdate {
                    answer: Some(answer.clone()),
                    status: Some(MessageState::Success),
                    ..Default::default()
                },
            )
            .await?;

        // a stop that raced the final write wins
        if !ctx.finish(MessageState::Success) {
            return Err(TurnError::NotRunning.into());
        }
        Ok(answer)
    }

    async fn process_error(&self, engine: &Engine, ctx: &RequestContext, error: &Error) {
        ctx.finish(MessageState::Failed);
        let state = ctx.state();
        let message_id = ctx.message_id();

        if message_id.is_empty() {
            debug!(agent = %self.persona, error = %error, "Turn rejected before a message existed");
            ctx.emit(EventPayload::Error {
                message: format!("Turn failed: {error}"),
            });
            return;
        }

        if let Err(e) = engine
            .store()
            .update_message(
                &message_id,
                MessageUpdate {
                    answer: Some(ctx.round_text()),
                    status: Some(state),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(message_id = %message_id, error = %e, "Failed to persist the outcome of a turn");
        }

        if state == MessageState::Stopped {
            info!(agent = %self.persona, message_id = %message_id, "Turn stopped");
            ctx.emit(EventPayload::WorkflowFinished {
                data: WorkflowData {
                    status: RunStatus::Stopped,
                },
            });
            engine.events().publish(DomainEvent::TurnFinished {
                conversation_id: ctx.conversation_id(),
                message_id,
                status: MessageState::Stopped,
                rounds: ctx.round(),
                timestamp: Utc::now(),
            });
        } else {
            warn!(agent = %self.persona, message_id = %message_id, error = %error, "Turn failed");
            ctx.emit(EventPayload::Error {
                message: format!("Turn failed: {error}"),
            });
            engine.events().publish(DomainEvent::TurnFailed {
                conversation_id: ctx.conversation_id(),
                message_id,
                error_message: error.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}
