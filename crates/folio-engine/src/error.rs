use std::time::Duration;

use folio_core::edits::EditError;
use folio_core::errors::RuntimeError;
use folio_core::ids::{EditId, SessionId};
use folio_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session {session_id} is busy (waited {waited:?})")]
    SessionBusy {
        session_id: SessionId,
        waited: Duration,
    },

    #[error("session {session_id} is corrupt: {reason}")]
    SessionCorrupt { session_id: SessionId, reason: String },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error("unknown or expired continuation token")]
    UnknownContinuation,

    #[error("event buffer overrun at sequence {sequence}")]
    BufferOverrun { sequence: u64 },

    #[error("runtime failure: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("turn cancelled")]
    Cancelled,

    #[error("max steps exceeded: {0}")]
    MaxStepsExceeded(u32),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Classification string carried on `error` stream events.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionBusy { .. } => "session_busy",
            Self::SessionCorrupt { .. } => "session_corrupt",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Edit(e) => e.error_kind(),
            Self::UnknownContinuation => "unknown_continuation",
            Self::BufferOverrun { .. } => "buffer_overrun",
            Self::Runtime(_) | Self::MaxStepsExceeded(_) => "runtime_failure",
            Self::Store(_) => "store",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// The edit an error is about, when there is one.
    pub fn edit_id(&self) -> Option<&EditId> {
        match self {
            Self::Edit(EditError::CommitConflict { edit_id, .. }) => Some(edit_id),
            _ => None,
        }
    }
}

/// Failure of a single tool call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ToolError {
    /// Recoverable errors go back to the runtime as an error result.
    /// Anything else ends the turn.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::UnknownTool(_) | Self::InvalidArguments(_) => true,
            Self::Edit(e) => e.is_recoverable(),
            Self::Store(_) => false,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) | Self::InvalidArguments(_) => "invalid_operation",
            Self::Edit(e) => e.error_kind(),
            Self::Store(_) => "store",
        }
    }
}

impl From<ToolError> for EngineError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Edit(e) => EngineError::Edit(e),
            ToolError::Store(e) => EngineError::Store(e),
            other => EngineError::Edit(EditError::InvalidOperation(other.to_string())),
        }
    }
}
