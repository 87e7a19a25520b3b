//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST   /v1/chat-messages`                 — Run a turn (blocking JSON or SSE stream)
//! - `POST   /v1/chat-messages/{task_id}/stop`  — Stop a running turn
//! - `GET    /v1/messages`                      — Message history of a conversation
//! - `GET    /v1/messages/{id}/suggested`       — Follow-up questions for a message
//! - `POST   /v1/messages/{id}/feedbacks`       — Like, dislike or clear a rating
//! - `POST   /v1/conversations/{id}/name`       — Rename (or auto-name) a conversation
//! - `DELETE /v1/conversations/{id}`            — Disable a conversation

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use agentry_agent::{Engine, EventPayload, HistoryPage, RenameMode, RequestContext};
use agentry_core::error::{Error, StoreError};
use agentry_core::message::{MessageState, Rating};
use agentry_core::turn::TurnRequest;

// ── State ─────────────────────────────────────────────────────────────────

pub struct ApiV1State {
    pub engine: Engine,
    /// Streaming turns with no message chunk within this window are stopped.
    pub first_token_timeout: Option<Duration>,
}

impl ApiV1State {
    pub fn new(engine: Engine) -> Self {
        let secs = engine.config().gateway.first_token_timeout_secs;
        Self {
            first_token_timeout: (secs > 0).then(|| Duration::from_secs(secs)),
            engine,
        }
    }
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/chat-messages", post(chat_messages_handler))
        .route("/chat-messages/{task_id}/stop", post(stop_handler))
        .route("/messages", get(history_handler))
        .route("/messages/{id}/suggested", get(suggested_handler))
        .route("/messages/{id}/feedbacks", post(feedback_handler))
        .route("/conversations/{id}/name", post(rename_handler))
        .route("/conversations/{id}", axum::routing::delete(delete_conversation_handler))
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Engine(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Engine(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "invalid_param", message),
            Self::Engine(e) if e.is_precondition() => (StatusCode::BAD_REQUEST, "bad_request", e.to_string()),
            Self::Engine(e @ Error::Store(StoreError::NotFound { .. })) => {
                (StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            Self::Engine(e) if e.is_stopped() => (StatusCode::CONFLICT, "stopped", e.to_string()),
            Self::Engine(e) => {
                warn!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
            }
        };
        (status, Json(ErrorResponse { code, message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ResponseMode {
    #[default]
    Blocking,
    Streaming,
}

#[derive(Deserialize)]
struct ChatMessagesRequest {
    #[serde(default)]
    inputs: Map<String, Value>,
    #[serde(default)]
    query: String,
    #[serde(default)]
    response_mode: ResponseMode,
    /// Empty or missing opens a new conversation.
    #[serde(default)]
    conversation_id: Option<String>,
    /// Regenerate this message.
    #[serde(default)]
    message_id: Option<String>,
    user: String,
    #[serde(default = "default_agent")]
    agent: String,
    #[serde(default)]
    model: Option<String>,
}

fn default_agent() -> String {
    "chat".into()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl ChatMessagesRequest {
    fn into_turn(self) -> ApiResult<TurnRequest> {
        if self.user.is_empty() {
            return Err(ApiError::BadRequest("user is required".into()));
        }
        let mut request = TurnRequest::new(self.agent, self.user, self.query);
        request.inputs = self.inputs;
        request.conversation_id = non_empty(self.conversation_id);
        request.message_id = non_empty(self.message_id);
        request.model = non_empty(self.model);
        Ok(request)
    }
}

#[derive(Serialize)]
struct ChatMessageResponse {
    event: &'static str,
    task_id: String,
    message_id: String,
    conversation_id: String,
    answer: String,
    status: MessageState,
    metadata: ChatMetadata,
}

#[derive(Serialize)]
struct ChatMetadata {
    rounds: u32,
    tool_calls: usize,
}

#[derive(Deserialize)]
struct UserBody {
    user: String,
}

#[derive(Deserialize)]
struct UserQuery {
    user: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    conversation_id: String,
    user: String,
    #[serde(default)]
    first_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct RenameRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    auto_generate: bool,
    user: String,
}

#[derive(Deserialize)]
struct FeedbackRequest {
    /// `null` withdraws the rating.
    #[serde(default)]
    rating: Option<Rating>,
    #[serde(default)]
    content: Option<String>,
    user: String,
}

#[derive(Serialize)]
struct RenameResponse {
    id: String,
    name: String,
}

fn success() -> Json<Value> {
    Json(json!({ "result": "success" }))
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn chat_messages_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<ChatMessagesRequest>,
) -> ApiResult<Response> {
    let mode = payload.response_mode;
    let request = payload.into_turn()?;
    info!(agent = %request.agent, mode = ?mode, conversation_id = ?request.conversation_id, "v1/chat-messages request");

    match mode {
        ResponseMode::Blocking => {
            let result = state.engine.run_blocking(request).await?;
            Ok(Json(ChatMessageResponse {
                event: "message",
                task_id: result.message_id.clone(),
                message_id: result.message_id,
                conversation_id: result.conversation_id,
                answer: result.answer,
                status: result.status,
                metadata: ChatMetadata {
                    rounds: result.rounds,
                    tool_calls: result.tool_calls.len(),
                },
            })
            .into_response())
        }
        ResponseMode::Streaming => {
            let stream = state.engine.run_streaming(request).await?;

            let first_token = Arc::new(AtomicBool::new(false));
            if let Some(timeout) = state.first_token_timeout {
                spawn_first_token_watchdog(stream.context().clone(), first_token.clone(), timeout);
            }

            // The turn stream moves into the response; a dropped connection drops it and stops the turn.
            let events = stream.map(move |event| {
                if matches!(event.payload, EventPayload::Message { .. }) {
                    first_token.store(true, Ordering::SeqCst);
                }
                let data = serde_json::to_string(&event).unwrap_or_default();
                Ok::<_, Infallible>(SseEvent::default().event(event.event_type()).data(data))
            });
            Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response())
        }
    }
}

fn spawn_first_token_watchdog(ctx: Arc<RequestContext>, first_token: Arc<AtomicBool>, timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if !first_token.load(Ordering::SeqCst) && ctx.state() == MessageState::Running {
            warn!(
                message_id = %ctx.message_id(),
                timeout_secs = timeout.as_secs(),
                "No message chunk in time, stopping turn"
            );
            ctx.stop();
        }
    });
}

async fn stop_handler(
    State(state): State<SharedApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<UserBody>,
) -> ApiResult<Json<Value>> {
    state.engine.stop(&task_id, &body.user).await?;
    Ok(success())
}

async fn history_handler(
    State(state): State<SharedApiState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryPage>> {
    let page = state
        .engine
        .history(&query.conversation_id, &query.user, query.first_id.as_deref(), query.limit)
        .await?;
    Ok(Json(page))
}

async fn suggested_handler(
    State(state): State<SharedApiState>,
    Path(message_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<Value>> {
    let questions = state.engine.suggest_questions(&message_id, &query.user).await?;
    Ok(Json(json!({ "result": "success", "data": questions })))
}

async fn feedback_handler(
    State(state): State<SharedApiState>,
    Path(message_id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> ApiResult<Json<Value>> {
    if body.user.is_empty() {
        return Err(ApiError::BadRequest("user is required".into()));
    }
    state
        .engine
        .feedback_message(&message_id, &body.user, body.rating, non_empty(body.content))
        .await?;
    Ok(success())
}

async fn rename_handler(
    State(state): State<SharedApiState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<Json<RenameResponse>> {
    let mode = if body.auto_generate {
        RenameMode::Auto
    } else {
        match non_empty(body.name) {
            Some(name) => RenameMode::Manual(name),
            None => return Err(ApiError::BadRequest("name is required unless auto_generate is set".into())),
        }
    };
    let name = state.engine.rename_conversation(&conversation_id, &body.user, mode).await?;
    Ok(Json(RenameResponse {
        id: conversation_id,
        name,
    }))
}

async fn delete_conversation_handler(
    State(state): State<SharedApiState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<UserBody>,
) -> ApiResult<Json<Value>> {
    state.engine.delete_conversation(&conversation_id, &body.user).await?;
    Ok(success())
}
