//! Conversation store — the persistence contract for chat transcripts.
//!
//! DESIGN
//! ======
//! The session layer only needs create/get/append, so that is the whole
//! trait. The production implementation is a thin SQLx/Postgres mapping;
//! tests run against an in-memory store. Messages are append-only and the
//! store clamps timestamps so they never run backwards within a
//! conversation, even if callers race the clock.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::protocol::{ChatMessage, ErrorCode, Role};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("conversation not found: {0}")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for ConversationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => crate::protocol::CODE_CONVERSATION_NOT_FOUND,
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// A transcript owned by exactly one user, ordered oldest-first.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub messages: Vec<ChatMessage>,
}

// =============================================================================
// STORE CONTRACT
// =============================================================================

/// Minimal persistence contract consumed by the chat endpoint.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation owned by `user_id`.
    async fn create(&self, user_id: Uuid) -> Result<Conversation, ConversationError>;

    /// Fetch a conversation with its full message list. `NotFound` when the
    /// id does not exist or belongs to another user.
    async fn get(&self, user_id: Uuid, conversation_id: Uuid) -> Result<Conversation, ConversationError>;

    /// Append one finalized message. `NotFound` under the same ownership
    /// rules as [`ConversationStore::get`].
    async fn append(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message: ChatMessage,
    ) -> Result<(), ConversationError>;
}

// =============================================================================
// POSTGRES STORE
// =============================================================================

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn create(&self, user_id: Uuid) -> Result<Conversation, ConversationError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO conversations (id, user_id) VALUES ($1, $2)")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(Conversation { id, user_id, messages: Vec::new() })
    }

    async fn get(&self, user_id: Uuid, conversation_id: Uuid) -> Result<Conversation, ConversationError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = $1 AND user_id = $2)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Err(ConversationError::NotFound(conversation_id));
        }

        let rows = sqlx::query(
            "SELECT id, role, content, ts FROM messages WHERE conversation_id = $1 ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|r| ChatMessage {
                id: r.get("id"),
                role: if r.get::<String, _>("role") == "user" { Role::User } else { Role::Assistant },
                content: r.get("content"),
                timestamp: r.get("ts"),
            })
            .collect();

        Ok(Conversation { id: conversation_id, user_id, messages })
    }

    async fn append(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        message: ChatMessage,
    ) -> Result<(), ConversationError> {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        // Ownership guard and monotonic-timestamp clamp in one statement:
        // the row is only written when the conversation belongs to the user,
        // and its timestamp never precedes the last stored message.
        let result = sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, ts)
             SELECT $1, $2, $3, $4,
                    GREATEST($5, COALESCE((SELECT MAX(ts) FROM messages WHERE conversation_id = $2), 0))
             WHERE EXISTS(SELECT 1 FROM conversations WHERE id = $2 AND user_id = $6)",
        )
        .bind(message.id)
        .bind(conversation_id)
        .bind(role)
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ConversationError::NotFound(conversation_id));
        }
        Ok(())
    }
}

// =============================================================================
// TEST STORE
// =============================================================================


#[cfg(test)]
#[path = "conversation_test.rs"]
mod tests;
