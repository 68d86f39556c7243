//! Transcript assembler — server events in, a consistent transcript out.
//!
//! DESIGN
//! ======
//! A pure state machine: `apply` folds one server message into the
//! transcript and returns the effects the session manager must act on. At
//! most one streaming assistant message is open at a time; `text_chunk`
//! extends it in place and the turn's `text` replaces its content outright —
//! the server's final text is authoritative, not the chunk concatenation.
//!
//! Resume payloads replace local state verbatim. There is no merge logic:
//! the server owns the transcript.

use uuid::Uuid;

use crate::protocol::{ChatMessage, ServerMsg, TokenUsage, now_ms};

/// Prefix distinguishing synthesized error lines from genuine agent output.
const ERROR_PREFIX: &str = "⚠ ";

// =============================================================================
// TYPES
// =============================================================================

/// A confirmation card's worth of pending-action state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmPrompt {
    pub action_id: Uuid,
    pub tool: String,
    pub summary: String,
    /// Milliseconds since Unix epoch.
    pub expires_at: i64,
    /// When the request arrived locally; anchors the progress fraction.
    pub requested_at: i64,
}

impl ConfirmPrompt {
    /// Countdown remaining, clamped at zero.
    #[must_use]
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        (self.expires_at - now_ms).max(0)
    }

    /// Fraction of the approval window left, clamped to [0, 1].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self, now_ms: i64) -> f64 {
        let total = self.expires_at - self.requested_at;
        if total <= 0 {
            return 0.0;
        }
        (self.remaining_ms(now_ms) as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// What the session manager must do after folding in a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A conversation id is now bound to this session.
    ConversationBound(Uuid),
    /// The transcript changed; re-render.
    TranscriptChanged,
    /// A side-effecting action awaits approval.
    ConfirmRequested(ConfirmPrompt),
    /// The pending confirmation left UI-visible state (the gateway alone
    /// decides the action's actual fate).
    ConfirmCleared,
    /// The turn finished.
    TurnCompleted { usage: Option<TokenUsage> },
    /// The server no longer knows this conversation; the session must
    /// forget the stored id and start fresh.
    ConversationLost,
}

// =============================================================================
// ASSEMBLER
// =============================================================================

#[derive(Default)]
pub struct TranscriptAssembler {
    conversation_id: Option<Uuid>,
    messages: Vec<ChatMessage>,
    /// The last message is an assistant message still being streamed.
    streaming: bool,
    pending: Option<ConfirmPrompt>,
}

impl TranscriptAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<Uuid> {
        self.conversation_id
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn pending(&self) -> Option<&ConfirmPrompt> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Record the user's own utterance locally (the server does not echo it).
    pub fn push_local_user_message(&mut self, content: &str) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Drop the pending confirmation from UI-visible state, e.g. when the
    /// local countdown reaches zero.
    pub fn clear_pending(&mut self) -> Option<ConfirmPrompt> {
        self.pending.take()
    }

    /// Fold one server message into the transcript. Events are applied in
    /// strict arrival order; there is no reordering or buffering beyond the
    /// single open streaming message.
    pub fn apply(&mut self, msg: &ServerMsg) -> Vec<Effect> {
        match msg {
            ServerMsg::ConversationStarted { conversation_id } => {
                self.conversation_id = Some(*conversation_id);
                self.messages.clear();
                self.streaming = false;
                self.pending = None;
                vec![Effect::ConversationBound(*conversation_id), Effect::TranscriptChanged]
            }
            ServerMsg::ConversationResumed { conversation_id, messages } => {
                self.conversation_id = Some(*conversation_id);
                self.messages = messages.clone();
                self.streaming = false;
                self.pending = None;
                vec![Effect::ConversationBound(*conversation_id), Effect::TranscriptChanged]
            }
            ServerMsg::TextChunk { content } => {
                if self.streaming {
                    if let Some(last) = self.messages.last_mut() {
                        last.content.push_str(content);
                    }
                } else {
                    self.messages.push(ChatMessage::assistant(content));
                    self.streaming = true;
                }
                vec![Effect::TranscriptChanged]
            }
            ServerMsg::Text { content } => {
                if self.streaming {
                    if let Some(last) = self.messages.last_mut() {
                        last.content.clone_from(content);
                    }
                    self.streaming = false;
                } else {
                    self.messages.push(ChatMessage::assistant(content));
                }
                vec![Effect::TranscriptChanged]
            }
            ServerMsg::ConfirmRequest { action_id, tool, summary, expires_at } => {
                let prompt = ConfirmPrompt {
                    action_id: *action_id,
                    tool: tool.clone(),
                    summary: summary.clone(),
                    expires_at: *expires_at,
                    requested_at: now_ms(),
                };
                self.pending = Some(prompt.clone());
                vec![Effect::ConfirmRequested(prompt)]
            }
            ServerMsg::Complete { token_usage } => {
                self.streaming = false;
                let mut effects = Vec::new();
                if self.pending.take().is_some() {
                    effects.push(Effect::ConfirmCleared);
                }
                effects.push(Effect::TurnCompleted { usage: *token_usage });
                effects
            }
            ServerMsg::Error { content, code } => {
                if code.as_deref() == Some(crate::protocol::CODE_CONVERSATION_NOT_FOUND) {
                    self.conversation_id = None;
                    self.streaming = false;
                    return vec![Effect::ConversationLost];
                }
                self.streaming = false;
                self.messages
                    .push(ChatMessage::assistant(format!("{ERROR_PREFIX}{content}")));
                vec![Effect::TranscriptChanged]
            }
        }
    }
}

#[cfg(test)]
#[path = "assembler_test.rs"]
mod tests;
