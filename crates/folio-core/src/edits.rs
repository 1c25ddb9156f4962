use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EditId;

/// Name of an edit operation. Open-ended: any registered capability may add one.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation(String);

impl Operation {
    pub const ADD: &'static str = "ADD";
    pub const UPDATE: &'static str = "UPDATE";
    pub const DELETE: &'static str = "DELETE";
    pub const REORDER: &'static str = "REORDER";
    pub const SET_THEME: &'static str = "SET_THEME";
    pub const SET_TITLE: &'static str = "SET_TITLE";
    /// Start over: clears units and theme and sets the title.
    pub const CREATE: &'static str = "CREATE";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is(&self, name: &str) -> bool {
        self.0 == name
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Operation {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A proposed mutation staged during a turn. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
    pub edit_id: EditId,
    /// Target unit, or `None` for whole-document operations.
    pub unit_index: Option<usize>,
    pub operation: Operation,
    pub params: Value,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable history record of an edit once it has been applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedEdit {
    pub edit_id: EditId,
    pub unit_index: Option<usize>,
    pub operation: Operation,
    pub params: Value,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub applied_at: DateTime<Utc>,
    /// Document revision this edit produced.
    pub revision: u64,
}

impl AppliedEdit {
    pub fn from_pending(edit: PendingEdit, applied_at: DateTime<Utc>, revision: u64) -> Self {
        Self {
            edit_id: edit.edit_id,
            unit_index: edit.unit_index,
            operation: edit.operation,
            params: edit.params,
            preview: edit.preview,
            created_at: edit.created_at,
            applied_at,
            revision,
        }
    }
}

/// Outcome of a successful commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitResult {
    pub applied: Vec<AppliedEdit>,
    pub revision: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("commit conflict on {edit_id}: {reason}")]
    CommitConflict { edit_id: EditId, reason: String },
}

impl EditError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidTarget(_) => "invalid_target",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::CommitConflict { .. } => "commit_conflict",
        }
    }

    /// Bad arguments can be handed back to the model; a conflict cannot.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CommitConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_is_plain_string_on_the_wire() {
        let op = Operation::new(Operation::REORDER);
        assert_eq!(serde_json::to_value(&op).unwrap(), json!("REORDER"));
        assert!(op.is(Operation::REORDER));
        assert!(!op.is(Operation::ADD));
    }

    #[test]
    fn custom_operations_are_allowed() {
        let op: Operation = serde_json::from_value(json!("FILL_FIELD")).unwrap();
        assert_eq!(op.to_string(), "FILL_FIELD");
    }

    #[test]
    fn applied_edit_keeps_pending_fields() {
        let pending = PendingEdit {
            edit_id: EditId::new(),
            unit_index: Some(2),
            operation: Operation::new(Operation::UPDATE),
            params: json!({"content": "x"}),
            preview: "Update unit 3".into(),
            created_at: Utc::now(),
        };
        let applied = AppliedEdit::from_pending(pending.clone(), Utc::now(), 4);
        assert_eq!(applied.edit_id, pending.edit_id);
        assert_eq!(applied.unit_index, Some(2));
        assert_eq!(applied.preview, pending.preview);
        assert_eq!(applied.revision, 4);
    }

    #[test]
    fn conflict_names_the_edit() {
        let id = EditId::from_raw("edit_7");
        let err = EditError::CommitConflict {
            edit_id: id,
            reason: "unit already deleted".into(),
        };
        assert_eq!(err.to_string(), "commit conflict on edit_7: unit already deleted");
        assert!(!err.is_recoverable());
        assert!(EditError::InvalidTarget("9".into()).is_recoverable());
    }
}
