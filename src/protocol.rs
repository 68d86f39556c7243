//! Wire protocol for the chat channel.
//!
//! DESIGN
//! ======
//! The channel speaks JSON text frames, one message per frame, discriminated
//! by a `type` tag. The message set is closed: five client kinds, seven
//! server kinds. Both the server routes and the client session layer
//! deserialize into these enums, so a protocol change is a single edit.
//!
//! Timestamps are milliseconds since the Unix epoch throughout.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// The bound conversation no longer exists server-side; the client must
/// forget its stored id and start fresh.
pub const CODE_CONVERSATION_NOT_FOUND: &str = "E_CONVERSATION_NOT_FOUND";

/// No pending action with that id for this user.
pub const CODE_ACTION_NOT_FOUND: &str = "E_ACTION_NOT_FOUND";

/// The approval window for the action has passed.
pub const CODE_ACTION_EXPIRED: &str = "E_ACTION_EXPIRED";

// =============================================================================
// SHARED TYPES
// =============================================================================

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A finalized conversation message. Streaming state exists only inside the
/// client assembler; anything stored or sent in a resume payload is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), role: Role::User, content: content.into(), timestamp: now_ms() }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), role: Role::Assistant, content: content.into(), timestamp: now_ms() }
    }
}

/// Token accounting reported on turn completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// =============================================================================
// CLIENT → SERVER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Start a fresh conversation and bind it to this connection.
    NewConversation,
    /// Rebind a previously persisted conversation.
    ResumeConversation { conversation_id: Uuid },
    /// A user utterance; triggers one agent turn.
    Message { content: String },
    /// Approve a pending side-effecting action.
    Confirm { action_id: Uuid },
    /// Reject (or locally expire) a pending side-effecting action.
    Cancel { action_id: Uuid },
}

// =============================================================================
// SERVER → CLIENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    ConversationStarted {
        conversation_id: Uuid,
    },
    ConversationResumed {
        conversation_id: Uuid,
        messages: Vec<ChatMessage>,
    },
    /// Incremental assistant output. Extends the open streaming message.
    TextChunk {
        content: String,
    },
    /// Authoritative final assistant text for the turn. Replaces whatever the
    /// chunks accumulated to — the two are not guaranteed to be equal.
    Text {
        content: String,
    },
    /// A side-effecting action awaits human approval.
    ConfirmRequest {
        action_id: Uuid,
        tool: String,
        summary: String,
        /// Milliseconds since Unix epoch.
        expires_at: i64,
    },
    /// The turn is over; streaming and confirmation state clear client-side.
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },
    Error {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMsg {
    /// Build an error frame from a plain string, with no code.
    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self::Error { content: content.into(), code: None }
    }

    /// Build a structured error frame from a typed domain error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error { content: err.to_string(), code: Some(err.error_code().to_string()) }
    }

    /// The wire `type` tag, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConversationStarted { .. } => "conversation_started",
            Self::ConversationResumed { .. } => "conversation_resumed",
            Self::TextChunk { .. } => "text_chunk",
            Self::Text { .. } => "text",
            Self::ConfirmRequest { .. } => "confirm_request",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

// =============================================================================
// TIME
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// TESTS
// =============================================================================
