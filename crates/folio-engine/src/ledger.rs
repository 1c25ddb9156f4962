//! Per-session log of staged and applied edits.
//!
//! Staging never touches the document. A commit applies every staged edit in
//! staging order to a scratch copy and swaps it in only if all of them apply.

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use folio_core::document::Document;
use folio_core::edits::{AppliedEdit, CommitResult, EditError, Operation, PendingEdit};
use folio_core::ids::EditId;

use crate::capabilities::{CapabilitySet, Scratch, TargetScope, UnitOrigin};

#[derive(Clone, Debug, Default)]
pub struct EditLedger {
    pending: Vec<PendingEdit>,
    history: Vec<AppliedEdit>,
}

impl EditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a ledger from persisted history. Nothing is pending.
    pub fn with_history(history: Vec<AppliedEdit>) -> Self {
        Self {
            pending: Vec::new(),
            history,
        }
    }

    /// Validate and append a proposed edit. `doc` is the last committed document.
    pub fn stage(
        &mut self,
        caps: &CapabilitySet,
        doc: &Document,
        operation: Operation,
        unit_index: Option<usize>,
        params: Value,
    ) -> Result<PendingEdit, EditError> {
        let cap = caps
            .get(&operation)
            .ok_or_else(|| EditError::InvalidOperation(format!("unknown operation {operation}")))?;
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };
        cap.validate(&params)
            .map_err(|msg| EditError::InvalidOperation(format!("{operation}: {msg}")))?;

        // Units the scratch copy will hold once the pending edits apply,
        // counting inserts only. Deletes are not subtracted.
        let mut reset_pending = false;
        let mut unit_count = doc.len();
        for staged in self.pending.iter().filter_map(|e| caps.get(&e.operation)) {
            if staged.resets_units() {
                reset_pending = true;
                unit_count = 0;
            } else if staged.scope() == TargetScope::Insert {
                unit_count += 1;
            }
        }

        let unit_index = match cap.scope() {
            TargetScope::Unit => {
                let index = unit_index.ok_or_else(|| {
                    EditError::InvalidTarget(format!("{operation} needs a unit_index"))
                })?;
                if reset_pending {
                    return Err(EditError::InvalidTarget(format!(
                        "unit {index} is cleared by a staged new document; commit first"
                    )));
                }
                if index >= doc.len() {
                    return Err(EditError::InvalidTarget(format!(
                        "unit {index} out of range (document has {} units)",
                        doc.len()
                    )));
                }
                Some(index)
            }
            TargetScope::Insert => {
                let index = unit_index.unwrap_or(unit_count);
                if index > unit_count {
                    return Err(EditError::InvalidTarget(format!(
                        "position {index} out of range (at most {unit_count})"
                    )));
                }
                Some(index)
            }
            TargetScope::Document => None,
        };
        cap.check_bounds(&params, unit_count)
            .map_err(EditError::InvalidTarget)?;

        let edit = PendingEdit {
            edit_id: EditId::new(),
            unit_index,
            preview: cap.preview(unit_index, &params),
            operation,
            params,
            created_at: Utc::now(),
        };
        debug!(edit_id = %edit.edit_id, operation = %edit.operation, "edit staged");
        self.pending.push(edit.clone());
        Ok(edit)
    }

    /// Staged edits in staging order.
    pub fn list_pending(&self) -> &[PendingEdit] {
        &self.pending
    }

    pub fn history(&self) -> &[AppliedEdit] {
        &self.history
    }

    /// Apply every staged edit atomically.
    ///
    /// On conflict the document is untouched and every edit stays staged.
    /// Committing with nothing staged is a no-op that keeps the revision.
    pub fn commit(
        &mut self,
        caps: &CapabilitySet,
        doc: &mut Document,
    ) -> Result<CommitResult, EditError> {
        if self.pending.is_empty() {
            return Ok(CommitResult {
                applied: Vec::new(),
                revision: doc.revision,
            });
        }

        let mut scratch = Scratch::from_document(doc);
        for edit in &self.pending {
            let conflict = |reason: String| EditError::CommitConflict {
                edit_id: edit.edit_id.clone(),
                reason,
            };
            let cap = caps
                .get(&edit.operation)
                .ok_or_else(|| conflict(format!("operation {} is not registered", edit.operation)))?;

            let position = match cap.scope() {
                TargetScope::Unit => {
                    let index = edit
                        .unit_index
                        .ok_or_else(|| conflict("edit has no target unit".into()))?;
                    let position = scratch
                        .position_of(&UnitOrigin::Committed(index))
                        .ok_or_else(|| {
                            conflict(format!(
                                "unit {index} was removed by an earlier edit in this commit"
                            ))
                        })?;
                    Some(position)
                }
                TargetScope::Insert => edit.unit_index,
                TargetScope::Document => None,
            };
            cap.apply(&mut scratch, position, edit).map_err(conflict)?;
        }

        let revision = doc.revision + 1;
        *doc = scratch.into_document(revision);

        let applied_at = Utc::now();
        let applied: Vec<AppliedEdit> = self
            .pending
            .drain(..)
            .map(|e| AppliedEdit::from_pending(e, applied_at, revision))
            .collect();
        self.history.extend(applied.iter().cloned());
        debug!(revision, applied = applied.len(), "commit applied");

        Ok(CommitResult { applied, revision })
    }

    /// Drop every staged edit. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
