//! Events streamed to the caller during a turn.
//!
//! Wire names:
//! - `token`       — partial answer text
//! - `tool_call`   — a planned tool is being invoked
//! - `tool_result` — the invocation finished (successfully or degraded)
//! - `done`        — the turn is complete
//! - `error`       — the turn was aborted

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Partial answer text.
    Token { content: String },

    ToolCall {
        id: String,
        server: String,
        tool: String,
        input: serde_json::Value,
    },

    /// A failed call carries `success: false` and the error text.
    ToolResult {
        id: String,
        server: String,
        tool: String,
        success: bool,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Done {
        conversation_id: String,
        recalled: usize,
        tool_calls_made: usize,
    },

    Error { message: String },
}

impl AgentEvent {
    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// `done` and `error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
