//! Tools that stage edits. Nothing here touches the committed document.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use folio_core::edits::Operation;

use crate::error::ToolError;
use crate::registry::{Tool, TurnContext};
use crate::tools::{index_arg, pick_fields, position_arg, staged};

fn stage(
    ctx: &TurnContext<'_>,
    operation: &str,
    unit_index: Option<usize>,
    params: Value,
) -> Result<Value, ToolError> {
    let edit = ctx
        .lease
        .stage(Operation::new(operation), unit_index, params)?;
    let pending_count = ctx.lease.pending().len();
    debug!(
        session_id = %ctx.lease.session_id(),
        edit_id = %edit.edit_id,
        operation,
        pending_count,
        "edit staged"
    );
    Ok(staged(&edit, pending_count))
}

pub struct CreateDocumentTool;

#[async_trait]
impl Tool for CreateDocumentTool {
    fn name(&self) -> &str {
        "create_document"
    }

    fn description(&self) -> &str {
        "Start a new document with the given title. Replaces any existing units once committed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["title"],
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Title of the document"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        stage(ctx, Operation::CREATE, None, pick_fields(&args, &["title"]))
    }
}

pub struct AddUnitTool;

#[async_trait]
impl Tool for AddUnitTool {
    fn name(&self) -> &str {
        "add_unit"
    }

    fn description(&self) -> &str {
        "Stage a new unit (slide or field). Omit position, or pass -1, to append at the end."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["content"],
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Full HTML content of the unit"
                },
                "position": {
                    "type": "integer",
                    "description": "0-based insert position (-1 to append)"
                },
                "layout": {
                    "type": "string",
                    "description": "Layout hint, e.g. title, content, two-column"
                },
                "notes": {
                    "type": "string",
                    "description": "Speaker notes"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let position = position_arg(&args, "position")?;
        let params = pick_fields(&args, &["content", "layout", "notes"]);
        stage(ctx, Operation::ADD, position, params)
    }
}

pub struct UpdateUnitTool;

#[async_trait]
impl Tool for UpdateUnitTool {
    fn name(&self) -> &str {
        "update_unit"
    }

    fn description(&self) -> &str {
        "Stage a change to an existing unit. Only the fields given are replaced."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["unit_index"],
            "properties": {
                "unit_index": {
                    "type": "integer",
                    "description": "0-based index of the unit to update"
                },
                "content": {
                    "type": "string",
                    "description": "New HTML content"
                },
                "layout": {
                    "type": "string",
                    "description": "New layout hint"
                },
                "notes": {
                    "type": "string",
                    "description": "New speaker notes"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let index = index_arg(&args, "unit_index")?;
        let params = pick_fields(&args, &["content", "layout", "notes"]);
        stage(ctx, Operation::UPDATE, Some(index), params)
    }
}

pub struct DeleteUnitTool;

#[async_trait]
impl Tool for DeleteUnitTool {
    fn name(&self) -> &str {
        "delete_unit"
    }

    fn description(&self) -> &str {
        "Stage removal of a unit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["unit_index"],
            "properties": {
                "unit_index": {
                    "type": "integer",
                    "description": "0-based index of the unit to delete"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let index = index_arg(&args, "unit_index")?;
        stage(ctx, Operation::DELETE, Some(index), json!({}))
    }
}

pub struct ReorderUnitsTool;

#[async_trait]
impl Tool for ReorderUnitsTool {
    fn name(&self) -> &str {
        "reorder_units"
    }

    fn description(&self) -> &str {
        "Stage moving a unit from one position to another."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["from_index", "to_index"],
            "properties": {
                "from_index": {
                    "type": "integer",
                    "description": "Current 0-based index"
                },
                "to_index": {
                    "type": "integer",
                    "description": "Target 0-based index"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let from = index_arg(&args, "from_index")?;
        let to = index_arg(&args, "to_index")?;
        stage(ctx, Operation::REORDER, Some(from), json!({ "to_index": to }))
    }
}

pub struct SetThemeTool;

#[async_trait]
impl Tool for SetThemeTool {
    fn name(&self) -> &str {
        "set_theme"
    }

    fn description(&self) -> &str {
        "Stage document-wide theme settings such as colors and fonts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["theme"],
            "properties": {
                "theme": {
                    "type": "object",
                    "description": "Theme attributes, e.g. {\"primary_color\": \"#1a73e8\", \"font\": \"Inter\"}"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        stage(ctx, Operation::SET_THEME, None, pick_fields(&args, &["theme"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{lease_with_units, token};

    #[tokio::test]
    async fn add_unit_appends_when_position_is_minus_one() {
        let (_store, lease) = lease_with_units(&["a", "b"]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        let out = AddUnitTool
            .execute(json!({"content": "<h1>New</h1>", "position": -1}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["operation"], "ADD");
        assert_eq!(out["unit_index"], 2);
        assert_eq!(out["pending_count"], 1);

        let out = AddUnitTool
            .execute(json!({"content": "<h1>Next</h1>"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["unit_index"], 3);
        assert_eq!(out["pending_count"], 2);
        assert!(lease.document().len() == 2);
    }

    #[tokio::test]
    async fn update_out_of_range_is_invalid_target() {
        let (_store, lease) = lease_with_units(&["a"]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        let err = UpdateUnitTool
            .execute(json!({"unit_index": 5, "content": "x"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_target");
        assert!(err.is_recoverable());
        assert!(lease.pending().is_empty());
    }

    #[tokio::test]
    async fn reorder_and_delete_stage_against_committed_units() {
        let (_store, lease) = lease_with_units(&["a", "b", "c"]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        let out = ReorderUnitsTool
            .execute(json!({"from_index": 2, "to_index": 0}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["preview"], "Move unit 3 to position 1");

        let out = DeleteUnitTool
            .execute(json!({"unit_index": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["preview"], "Delete unit 2");
        assert_eq!(lease.pending().len(), 2);

        let err = ReorderUnitsTool
            .execute(json!({"from_index": 0, "to_index": 3}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_target");
    }

    #[tokio::test]
    async fn document_level_tools_have_no_unit_index() {
        let (_store, lease) = lease_with_units(&[]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        let out = CreateDocumentTool
            .execute(json!({"title": "Q3 Review"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["operation"], "CREATE");
        assert!(out["unit_index"].is_null());

        let out = SetThemeTool
            .execute(json!({"theme": {"font": "Inter"}}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["operation"], "SET_THEME");

        let err = CreateDocumentTool
            .execute(json!({"title": "   "}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_operation");
    }

    #[tokio::test]
    async fn create_document_starts_over_once_committed() {
        let (_store, lease) = lease_with_units(&["old 1", "old 2"]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        CreateDocumentTool
            .execute(json!({"title": "Fresh"}), &ctx)
            .await
            .unwrap();
        let out = AddUnitTool
            .execute(json!({"content": "first"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["unit_index"], 0);

        let err = UpdateUnitTool
            .execute(json!({"unit_index": 1, "content": "x"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_target");

        lease.commit().unwrap();
        let doc = lease.document();
        assert_eq!(doc.title.as_deref(), Some("Fresh"));
        assert_eq!(doc.units.len(), 1);
        assert_eq!(doc.units[0].content, "first");
    }
}
