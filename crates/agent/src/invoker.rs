//! Completion invoker — one cancellable streaming call per round.

use std::sync::Arc;

use agentry_config::TokenLimitMode;
use agentry_core::error::ProviderError;
use agentry_core::message::Message;
use agentry_core::provider::{Provider, ProviderRequest, Usage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::token::Tokenizer;

/// The model a persona runs on and its token budget.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    /// Model name as the provider knows it.
    pub model: String,
    pub temperature: f32,
    pub context_window: usize,
    /// Tokens reserved for the model's output.
    pub output_tokens: usize,
    /// BPE encoding of the model's tokenizer.
    pub token_encoding: String,
}

impl ModelProfile {
    /// Largest prompt that still leaves room for the output budget.
    pub fn prompt_limit(&self) -> usize {
        self.context_window.saturating_sub(self.output_tokens)
    }
}

pub struct CompletionInvoker {
    provider: Arc<dyn Provider>,
    profile: ModelProfile,
    tokenizer: Tokenizer,
    token_limit: TokenLimitMode,
}

impl CompletionInvoker {
    pub fn new(provider: Arc<dyn Provider>, profile: ModelProfile, token_limit: TokenLimitMode) -> Self {
        let tokenizer = Tokenizer::for_encoding(&profile.token_encoding);
        Self {
            provider,
            profile,
            tokenizer,
            token_limit,
        }
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Compare the prompt size, as the model's tokenizer counts it, against
    /// the model's budget.
    pub fn check_prompt(&self, system: &str, user: &str) -> Result<(), ProviderError> {
        let prompt_tokens = self.tokenizer.count_prompt(system, user);
        let limit = self.profile.prompt_limit();
        if prompt_tokens <= limit {
            return Ok(());
        }

        match self.token_limit {
            TokenLimitMode::Enforce => Err(ProviderError::PromptTooLarge { prompt_tokens, limit }),
            TokenLimitMode::Advisory => {
                warn!(
                    model = %self.profile.model,
                    encoding = %self.tokenizer.encoding(),
                    prompt_tokens,
                    limit,
                    "Prompt exceeds model budget, sending anyway"
                );
                Ok(())
            }
        }
    }

    /// Stream a completion, calling `on_chunk` for every non-empty text delta.
    ///
    /// Cancelling `cancel` stops delivery at the next suspension point and
    /// returns [`ProviderError::Aborted`]. Dropping the chunk receiver tells
    /// the provider to abandon the upstream request.
    pub async fn complete<F>(
        &self,
        system: &str,
        user: &str,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<Option<Usage>, ProviderError>
    where
        F: FnMut(&str) + Send,
    {
        self.check_prompt(system, user)?;

        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(user));

        let request = ProviderRequest {
            model: self.profile.model.clone(),
            messages,
            temperature: self.profile.temperature,
            max_tokens: None,
            stream: true,
            stop: vec![],
        };

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Aborted),
            rx = self.provider.stream(request) => rx?,
        };

        let mut usage = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(model = %self.profile.model, "Completion aborted");
                    return Err(ProviderError::Aborted);
                }
                chunk = rx.recv() => match chunk {
                    Some(Ok(chunk)) => {
                        if let Some(text) = chunk.content.as_deref()
                            && !text.is_empty()
                        {
                            on_chunk(text);
                        }
                        if chunk.usage.is_some() {
                            usage = chunk.usage;
                        }
                        if chunk.done {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        if let Some(u) = &usage {
            debug!(
                model = %self.profile.model,
                prompt_tokens = u.prompt_tokens,
                completion_tokens = u.completion_tokens,
                "Completion finished"
            );
        }
        Ok(usage)
    }
}
