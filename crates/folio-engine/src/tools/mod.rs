pub mod commit;
pub mod inspect;
pub mod staging;

use std::sync::Arc;

use serde_json::{json, Value};

use folio_core::edits::{EditError, PendingEdit};

use crate::error::ToolError;
use crate::registry::ToolRegistry;

/// Create a ToolRegistry with all built-in document tools.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // Staging
    registry.register(Arc::new(staging::CreateDocumentTool));
    registry.register(Arc::new(staging::AddUnitTool));
    registry.register(Arc::new(staging::UpdateUnitTool));
    registry.register(Arc::new(staging::DeleteUnitTool));
    registry.register(Arc::new(staging::ReorderUnitsTool));
    registry.register(Arc::new(staging::SetThemeTool));

    // Inspection
    registry.register(Arc::new(inspect::ListUnitsTool));
    registry.register(Arc::new(inspect::GetUnitTool));
    registry.register(Arc::new(inspect::GetPendingEditsTool));

    // Commit barrier
    registry.register(Arc::new(commit::CommitEditsTool));

    registry
}

/// Required non-negative unit index.
pub(crate) fn index_arg(args: &Value, key: &str) -> Result<usize, ToolError> {
    match args.get(key).and_then(Value::as_i64) {
        Some(i) if i >= 0 => Ok(i as usize),
        Some(i) => Err(EditError::InvalidTarget(format!("{key} must not be negative, got {i}")).into()),
        None => Err(ToolError::InvalidArguments(format!("{key} is required"))),
    }
}

/// Optional insert position. Absent, null or -1 mean "append".
pub(crate) fn position_arg(args: &Value, key: &str) -> Result<Option<usize>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(-1) => Ok(None),
            Some(i) if i >= 0 => Ok(Some(i as usize)),
            _ => Err(ToolError::InvalidArguments(format!(
                "{key} must be a non-negative integer or -1, got {v}"
            ))),
        },
    }
}

/// Copy the listed string fields that are present into a params object.
pub(crate) fn pick_fields(args: &Value, keys: &[&str]) -> Value {
    let mut params = serde_json::Map::new();
    for key in keys {
        if let Some(v) = args.get(*key).filter(|v| !v.is_null()) {
            params.insert((*key).to_string(), v.clone());
        }
    }
    Value::Object(params)
}

/// Result payload every staging tool returns.
pub(crate) fn staged(edit: &PendingEdit, pending_count: usize) -> Value {
    json!({
        "edit_id": edit.edit_id,
        "operation": edit.operation,
        "unit_index": edit.unit_index,
        "preview": edit.preview,
        "pending_count": pending_count,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use folio_core::edits::Operation;
    use folio_core::ids::TurnId;
    use folio_store::Database;

    use crate::capabilities::CapabilitySet;
    use crate::session_store::{Lease, SessionStore, SessionStoreConfig};

    /// A leased session whose committed document holds the given units.
    pub async fn lease_with_units(contents: &[&str]) -> (Arc<SessionStore>, Lease) {
        let store = Arc::new(SessionStore::new(
            Database::in_memory().unwrap(),
            Arc::new(CapabilitySet::builtin()),
            SessionStoreConfig::default(),
        ));
        let id = store.get_or_create(None).unwrap().session_id().clone();
        let lease = store
            .acquire_exclusive(&id, &TurnId::new(), Duration::ZERO)
            .await
            .unwrap();
        for content in contents {
            lease
                .stage(Operation::new(Operation::ADD), None, json!({"content": content}))
                .unwrap();
        }
        if !contents.is_empty() {
            lease.commit().unwrap();
            lease.persist().unwrap();
        }
        (store, lease)
    }

    pub fn token() -> CancellationToken {
        CancellationToken::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_document_tools() {
        let registry = create_default_registry();
        assert_eq!(registry.count(), 10);
        for name in [
            "create_document",
            "add_unit",
            "update_unit",
            "delete_unit",
            "reorder_units",
            "set_theme",
            "list_units",
            "get_unit",
            "get_pending_edits",
            "commit_edits",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[test]
    fn position_minus_one_appends() {
        assert_eq!(position_arg(&json!({"position": -1}), "position").unwrap(), None);
        assert_eq!(position_arg(&json!({}), "position").unwrap(), None);
        assert_eq!(position_arg(&json!({"position": 2}), "position").unwrap(), Some(2));
        assert!(position_arg(&json!({"position": -3}), "position").is_err());
    }

    #[test]
    fn negative_index_is_invalid_target() {
        let err = index_arg(&json!({"unit_index": -2}), "unit_index").unwrap_err();
        assert_eq!(err.error_kind(), "invalid_target");
        assert!(err.is_recoverable());
        assert!(matches!(
            index_arg(&json!({}), "unit_index"),
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[test]
    fn pick_fields_skips_missing_and_null() {
        let params = pick_fields(&json!({"content": "x", "notes": null}), &["content", "layout", "notes"]);
        assert_eq!(params, json!({"content": "x"}));
    }
}
