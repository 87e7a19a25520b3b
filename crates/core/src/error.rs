//! Error types for the Agentry domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Agentry operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Turn lifecycle errors ---
    #[error("Turn error: {0}")]
    Turn(#[from] TurnError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the turn ended because it was stopped, not because something broke.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            Error::Provider(ProviderError::Aborted) | Error::Turn(TurnError::NotRunning)
        )
    }

    /// Authorization / precondition failures are rejected before any state is created.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::Turn(
                TurnError::ConversationBusy(_)
                    | TurnError::ConversationDisabled(_)
                    | TurnError::Forbidden(_)
                    | TurnError::AgentNotFound(_)
                    | TurnError::ContextNotFound(_)
            )
        )
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// The message carried by a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Prompt too large: {prompt_tokens} tokens exceeds limit of {limit}")]
    PromptTooLarge { prompt_tokens: usize, limit: usize },

    #[error("Completion aborted")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Request is not running")]
    NotRunning,

    #[error("Conversation {0} is busy")]
    ConversationBusy(String),

    #[error("Conversation {0} is disabled")]
    ConversationDisabled(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("No running request for message {0}")]
    ContextNotFound(String),

    #[error("Invalid agent output: {0}")]
    InvalidOutput(String),
}
