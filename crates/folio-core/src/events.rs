use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ContinuationToken, EditId, SessionId, ToolCallId, TurnId};

/// Events produced by a turn, before sequencing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Init {
        session_id: SessionId,
        turn_id: TurnId,
        is_continuation: bool,
        revision: u64,
    },

    Status {
        message: String,
    },

    ToolCall {
        tool_call_id: ToolCallId,
        name: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        friendly: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    ToolResult {
        tool_call_id: ToolCallId,
        name: String,
        is_error: bool,
        content: Value,
        duration_ms: u64,
    },

    AssistantText {
        text: String,
    },

    CommitComplete {
        session_id: SessionId,
        applied_count: usize,
        revision: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continuation_token: Option<ContinuationToken>,
    },

    Error {
        error: String,
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edit_id: Option<EditId>,
    },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Status { .. } => "status",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::AssistantText { .. } => "assistant_text",
            Self::CommitComplete { .. } => "commit_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Every turn's stream ends with exactly one terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CommitComplete { .. } | Self::Error { .. })
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }
}

/// A turn event stamped with its per-turn sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: TurnEvent,
}
