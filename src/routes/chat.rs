//! Websocket chat endpoint — the realtime conversation channel.
//!
//! DESIGN
//! ======
//! On upgrade, the access token is validated and the connection enters a
//! reader loop plus a writer task joined by a bounded outbound channel, so
//! agent chunks stream to the socket as they are produced. Handler functions
//! are pure protocol logic — they validate, call services, and push
//! `ServerMsg`s; the writer owns serialization and send logging.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade with `?token=` → validate → per-user connection task
//! 2. `new_conversation` / `resume_conversation` binds a conversation
//! 3. `message` drives one agent turn (chunks → final text → complete, or a
//!    `confirm_request` that holds the turn open)
//! 4. `confirm` / `cancel` resolves the pending action and closes the turn
//! 5. Close → connection state dropped; the conversation survives in the
//!    store for later resumption

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{ChatMessage, ClientMsg, ServerMsg};
use crate::services;
use crate::services::agent::{AgentError, AgentEvent};
use crate::services::tools::ToolError;
use crate::state::AppState;

/// Outbound frames buffered between handlers and the socket writer.
const OUTBOUND_CAPACITY: usize = 64;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.get("token") else {
        return (StatusCode::UNAUTHORIZED, "token required").into_response();
    };

    let user_id = match services::auth::verify_access_token(&state.pool, token).await {
        Ok(Some(uid)) => uid,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "chat: token validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "token validation error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_chat(socket, state, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_chat(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMsg>(OUTBOUND_CAPACITY);

    info!(%user_id, "chat: client connected");

    // Writer task: owns the sink so handlers can stream frames while the
    // reader stays responsive.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                warn!(kind = msg.kind(), "chat: failed to serialize frame");
                continue;
            };
            match &msg {
                ServerMsg::Error { content, code } => {
                    warn!(code = code.as_deref().unwrap_or("-"), %content, "chat: send frame kind=error");
                }
                other => info!(kind = other.kind(), "chat: send frame"),
            }
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // The conversation bound to this connection, if any.
    let mut conversation: Option<Uuid> = None;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                if process_client_text(&state, &mut conversation, user_id, &out_tx, &text)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(out_tx);
    let _ = writer.await;
    info!(%user_id, "chat: client disconnected");
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse and process one inbound text frame, pushing replies to `out`.
///
/// Kept free of socket concerns so tests can drive the protocol end-to-end
/// against mock collaborators. `Err` means the outbound channel is gone and
/// the connection should wind down.
async fn process_client_text(
    state: &AppState,
    conversation: &mut Option<Uuid>,
    user_id: Uuid,
    out: &mpsc::Sender<ServerMsg>,
    text: &str,
) -> Result<(), ()> {
    let msg: ClientMsg = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(%user_id, error = %e, "chat: invalid inbound frame");
            return emit(out, ServerMsg::Error {
                content: format!("invalid message: {e}"),
                code: Some("E_BAD_MESSAGE".into()),
            })
            .await;
        }
    };

    match msg {
        ClientMsg::NewConversation => handle_new_conversation(state, conversation, user_id, out).await,
        ClientMsg::ResumeConversation { conversation_id } => {
            handle_resume(state, conversation, user_id, conversation_id, out).await
        }
        ClientMsg::Message { content } => handle_message(state, *conversation, user_id, &content, out).await,
        ClientMsg::Confirm { action_id } => handle_confirm(state, *conversation, user_id, action_id, out).await,
        ClientMsg::Cancel { action_id } => handle_cancel(state, user_id, action_id, out).await,
    }
}

// =============================================================================
// CONVERSATION BINDING
// =============================================================================

async fn handle_new_conversation(
    state: &AppState,
    conversation: &mut Option<Uuid>,
    user_id: Uuid,
    out: &mpsc::Sender<ServerMsg>,
) -> Result<(), ()> {
    match state.store.create(user_id).await {
        Ok(created) => {
            *conversation = Some(created.id);
            info!(%user_id, conversation_id = %created.id, "chat: conversation started");
            emit(out, ServerMsg::ConversationStarted { conversation_id: created.id }).await
        }
        Err(e) => emit(out, ServerMsg::error_from(&e)).await,
    }
}

async fn handle_resume(
    state: &AppState,
    conversation: &mut Option<Uuid>,
    user_id: Uuid,
    conversation_id: Uuid,
    out: &mpsc::Sender<ServerMsg>,
) -> Result<(), ()> {
    match state.store.get(user_id, conversation_id).await {
        Ok(found) => {
            *conversation = Some(found.id);
            info!(%user_id, %conversation_id, messages = found.messages.len(), "chat: conversation resumed");
            emit(out, ServerMsg::ConversationResumed { conversation_id: found.id, messages: found.messages }).await
        }
        Err(e) => {
            warn!(%user_id, %conversation_id, error = %e, "chat: resume failed");
            emit(out, ServerMsg::error_from(&e)).await
        }
    }
}

// =============================================================================
// AGENT TURN
// =============================================================================

async fn handle_message(
    state: &AppState,
    conversation: Option<Uuid>,
    user_id: Uuid,
    content: &str,
    out: &mpsc::Sender<ServerMsg>,
) -> Result<(), ()> {
    let Some(conversation_id) = conversation else {
        return emit(out, ServerMsg::Error {
            content: "no conversation bound; send new_conversation or resume_conversation first".into(),
            code: Some("E_NO_CONVERSATION".into()),
        })
        .await;
    };

    let Some(agent) = &state.agent else {
        return emit(out, ServerMsg::error_from(&AgentError::Unavailable)).await;
    };

    if let Err(e) = state
        .store
        .append(user_id, conversation_id, ChatMessage::user(content))
        .await
    {
        return emit(out, ServerMsg::error_from(&e)).await;
    }

    let history = match state.store.get(user_id, conversation_id).await {
        Ok(found) => found.messages,
        Err(e) => return emit(out, ServerMsg::error_from(&e)).await,
    };

    let mut events = match agent.begin_turn(user_id, &history).await {
        Ok(rx) => rx,
        Err(e) => return emit(out, ServerMsg::error_from(&e)).await,
    };

    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Chunk(chunk) => {
                emit(out, ServerMsg::TextChunk { content: chunk }).await?;
            }
            AgentEvent::Final(text) => {
                if let Err(e) = state
                    .store
                    .append(user_id, conversation_id, ChatMessage::assistant(&text))
                    .await
                {
                    // The reply still reaches the client; resumption will
                    // just miss this message.
                    warn!(%conversation_id, error = %e, "chat: assistant append failed");
                }
                emit(out, ServerMsg::Text { content: text }).await?;
            }
            AgentEvent::RequestApproval { tool, input, summary } => {
                let action = state.gateway.register(user_id, &tool, input, &summary);
                emit(out, ServerMsg::ConfirmRequest {
                    action_id: action.id,
                    tool: action.tool,
                    summary: action.summary,
                    expires_at: action.expires_at,
                })
                .await?;
                // The turn stays open: no `complete` until the pending
                // action resolves via confirm/cancel (or expires).
            }
            AgentEvent::Complete { usage } => {
                emit(out, ServerMsg::Complete { token_usage: usage }).await?;
            }
            AgentEvent::Failed(e) => {
                warn!(%user_id, %conversation_id, error = %e, "chat: agent turn failed");
                emit(out, ServerMsg::error_from(&e)).await?;
            }
        }
    }

    Ok(())
}

// =============================================================================
// CONFIRMATION RESOLUTION
// =============================================================================

async fn handle_confirm(
    state: &AppState,
    conversation: Option<Uuid>,
    user_id: Uuid,
    action_id: Uuid,
    out: &mpsc::Sender<ServerMsg>,
) -> Result<(), ()> {
    let action = match state.gateway.confirm(user_id, action_id) {
        Ok(action) => action,
        Err(e) => {
            warn!(%user_id, %action_id, error = %e, "chat: confirm rejected");
            return emit(out, ServerMsg::error_from(&e)).await;
        }
    };

    let Some(tools) = &state.tools else {
        emit(out, ServerMsg::error_from(&ToolError::Unavailable)).await?;
        return emit(out, ServerMsg::Complete { token_usage: None }).await;
    };

    // The gateway released the action exactly once; this is the one
    // execution of the confirmed tool call.
    match tools.execute(user_id, &action.tool, &action.input).await {
        Ok(outcome) => {
            if let Some(conversation_id) = conversation {
                if let Err(e) = state
                    .store
                    .append(user_id, conversation_id, ChatMessage::assistant(&outcome.message))
                    .await
                {
                    warn!(%conversation_id, error = %e, "chat: tool outcome append failed");
                }
            }
            emit(out, ServerMsg::Text { content: outcome.message }).await?;
            if let Some(change) = outcome.change {
                state.feed.publish(&change);
            }
            emit(out, ServerMsg::Complete { token_usage: None }).await
        }
        Err(e) => {
            warn!(%user_id, tool = %action.tool, error = %e, "chat: tool execution failed");
            emit(out, ServerMsg::error_from(&e)).await?;
            emit(out, ServerMsg::Complete { token_usage: None }).await
        }
    }
}

async fn handle_cancel(
    state: &AppState,
    user_id: Uuid,
    action_id: Uuid,
    out: &mpsc::Sender<ServerMsg>,
) -> Result<(), ()> {
    match state.gateway.cancel(user_id, action_id) {
        Ok(()) => {
            info!(%user_id, %action_id, "chat: action cancelled");
            emit(out, ServerMsg::Complete { token_usage: None }).await
        }
        Err(e) => emit(out, ServerMsg::error_from(&e)).await,
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn emit(out: &mpsc::Sender<ServerMsg>, msg: ServerMsg) -> Result<(), ()> {
    out.send(msg).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
