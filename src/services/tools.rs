//! Tool executor — the contract for running a confirmed side-effecting call.
//!
//! The chat endpoint invokes this exactly once per confirmed action. Tool
//! business logic lives behind the trait; this crate only defines the shape
//! of an outcome and the change notice fed to the broadcast hub.

use async_trait::async_trait;
use uuid::Uuid;

use crate::protocol::ErrorCode;
use crate::services::broadcast::ChangeEvent;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool {tool} failed: {message}")]
    Failed { tool: String, message: String },
    #[error("tool execution not configured")]
    Unavailable,
}

impl ErrorCode for ToolError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "E_TOOL_UNKNOWN",
            Self::Failed { .. } => "E_TOOL_FAILED",
            Self::Unavailable => "E_TOOLS_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Result of a successful tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// User-facing summary of what happened, appended to the transcript.
    pub message: String,
    /// Coarse change notice for the broadcast feed, when the tool mutated a
    /// dashboard-visible resource.
    pub change: Option<ChangeEvent>,
}

/// Executes a tool call on behalf of a user. Only ever invoked after the
/// approval gateway has confirmed the action.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        user_id: Uuid,
        tool: &str,
        input: &serde_json::Value,
    ) -> Result<ToolOutcome, ToolError>;
}
