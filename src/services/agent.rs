//! Agent backend — the conversational collaborator behind the chat channel.
//!
//! DESIGN
//! ======
//! The chat endpoint consumes agent turns as a stream of [`AgentEvent`]s
//! over a channel, so the transport loop can forward chunks as they appear.
//! `LlmAgent` adapts an [`LlmChat`] client to that contract: text blocks
//! become chunks followed by the authoritative final text, `tool_use` blocks
//! become approval requests. The upstream call is request/response, so the
//! chunks are coarse; the protocol contract (`text` wins over accumulated
//! chunks) is what downstream code relies on.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::llm::LlmChat;
use crate::llm::types::{Content, ContentBlock, Message, Tool};
use crate::protocol::{ChatMessage, ErrorCode, Role, TokenUsage};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const MAX_TOKENS: u32 = 1024;
const SUMMARY_MAX_CHARS: usize = 120;

const SYSTEM_PROMPT: &str = "You are a personal finance assistant. Answer questions about the \
user's balances, budgets, savings goals, and subscriptions. Use the provided tools for any \
action that moves money or changes stored data; never claim to have performed such an action \
without calling its tool.";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent backend not configured")]
    Unavailable,
    #[error("agent request failed: {0}")]
    Request(String),
}

impl ErrorCode for AgentError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable => "E_AGENT_UNAVAILABLE",
            Self::Request(_) => "E_AGENT_REQUEST",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// One step of an agent turn, in emission order.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental assistant text.
    Chunk(String),
    /// Authoritative final text for the turn.
    Final(String),
    /// The agent wants to run a side-effecting tool; the turn stays open
    /// until a human resolves the request.
    RequestApproval {
        tool: String,
        input: serde_json::Value,
        summary: String,
    },
    /// Normal end of turn.
    Complete { usage: Option<TokenUsage> },
    /// The turn failed; surfaced to the user, conversation continues.
    Failed(AgentError),
}

/// A side-effecting tool the agent may request. The catalog doubles as the
/// provider tool definitions and the approval vocabulary.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Produces one agent turn at a time for the chat endpoint.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Start a turn over the conversation history (the latest user message
    /// is the last history entry). Events arrive on the returned channel.
    async fn begin_turn(
        &self,
        user_id: Uuid,
        history: &[ChatMessage],
    ) -> Result<mpsc::Receiver<AgentEvent>, AgentError>;
}

// =============================================================================
// LLM ADAPTER
// =============================================================================

pub struct LlmAgent {
    client: Arc<dyn LlmChat>,
    tools: Vec<Tool>,
}

impl LlmAgent {
    #[must_use]
    pub fn new(client: Arc<dyn LlmChat>, catalog: Vec<ToolSpec>) -> Self {
        let tools = catalog
            .into_iter()
            .map(|spec| Tool {
                name: spec.name,
                description: spec.description,
                input_schema: spec.input_schema,
            })
            .collect();
        Self { client, tools }
    }
}

#[async_trait]
impl AgentBackend for LlmAgent {
    async fn begin_turn(
        &self,
        user_id: Uuid,
        history: &[ChatMessage],
    ) -> Result<mpsc::Receiver<AgentEvent>, AgentError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = Arc::clone(&self.client);
        let tools = self.tools.clone();
        let messages: Vec<Message> = history.iter().map(to_provider_message).collect();

        tokio::spawn(async move {
            let tools_arg = if tools.is_empty() { None } else { Some(tools.as_slice()) };
            let response = client
                .chat(MAX_TOKENS, SYSTEM_PROMPT, &messages, tools_arg)
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(%user_id, error = %e, "agent: provider call failed");
                    let _ = tx.send(AgentEvent::Failed(AgentError::Request(e.to_string()))).await;
                    return;
                }
            };

            let mut text = String::new();
            let mut approval: Option<AgentEvent> = None;
            for block in response.content {
                match block {
                    ContentBlock::Text { text: t } => {
                        if tx.send(AgentEvent::Chunk(t.clone())).await.is_err() {
                            return;
                        }
                        text.push_str(&t);
                    }
                    ContentBlock::ToolUse { name, input, .. } => {
                        let summary = summarize(&name, &input);
                        approval = Some(AgentEvent::RequestApproval { tool: name, input, summary });
                    }
                    ContentBlock::Unknown => {}
                }
            }

            if !text.is_empty() && tx.send(AgentEvent::Final(text)).await.is_err() {
                return;
            }

            // An approval request holds the turn open; otherwise close it.
            if let Some(event) = approval {
                let _ = tx.send(event).await;
            } else {
                let usage = Some(TokenUsage {
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                });
                let _ = tx.send(AgentEvent::Complete { usage }).await;
            }
        });

        Ok(rx)
    }
}

fn to_provider_message(msg: &ChatMessage) -> Message {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    Message { role: role.into(), content: Content::Text(msg.content.clone()) }
}

/// Human-readable one-liner for the confirmation card.
fn summarize(tool: &str, input: &serde_json::Value) -> String {
    let args = serde_json::to_string(input).unwrap_or_default();
    let mut summary = format!("{tool} {args}");
    if summary.chars().count() > SUMMARY_MAX_CHARS {
        summary = summary.chars().take(SUMMARY_MAX_CHARS - 1).collect();
        summary.push('…');
    }
    summary
}

#[cfg(test)]
#[path = "agent_test.rs"]
mod tests;
