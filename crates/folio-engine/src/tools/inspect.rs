//! Read-only tools over the committed document and the staged edits.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use folio_core::edits::EditError;

use crate::error::ToolError;
use crate::registry::{Tool, TurnContext};
use crate::tools::index_arg;

const PREVIEW_CHARS: usize = 100;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

fn text_preview(content: &str) -> String {
    let text = TAG.replace_all(content, " ");
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}

pub struct ListUnitsTool;

#[async_trait]
impl Tool for ListUnitsTool {
    fn name(&self) -> &str {
        "list_units"
    }

    fn description(&self) -> &str {
        "List the units of the saved document with a short text preview of each. Staged edits are not shown."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let doc = ctx.lease.document();
        let units: Vec<Value> = doc
            .units
            .iter()
            .map(|u| {
                json!({
                    "index": u.index,
                    "layout": u.layout,
                    "preview": text_preview(&u.content),
                    "has_notes": u.notes.as_deref().is_some_and(|n| !n.is_empty()),
                })
            })
            .collect();
        Ok(json!({
            "title": doc.title,
            "revision": doc.revision,
            "unit_count": units.len(),
            "units": units,
            "pending_count": ctx.lease.pending().len(),
        }))
    }
}

pub struct GetUnitTool;

#[async_trait]
impl Tool for GetUnitTool {
    fn name(&self) -> &str {
        "get_unit"
    }

    fn description(&self) -> &str {
        "Get the full content, layout and notes of one saved unit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["unit_index"],
            "properties": {
                "unit_index": {
                    "type": "integer",
                    "description": "0-based index of the unit"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let index = index_arg(&args, "unit_index")?;
        let doc = ctx.lease.document();
        let unit = doc.unit(index).ok_or_else(|| {
            EditError::InvalidTarget(format!(
                "unit {index} out of range (document has {} units)",
                doc.len()
            ))
        })?;
        Ok(json!({
            "index": unit.index,
            "content": unit.content,
            "layout": unit.layout,
            "notes": unit.notes,
        }))
    }
}

pub struct GetPendingEditsTool;

#[async_trait]
impl Tool for GetPendingEditsTool {
    fn name(&self) -> &str {
        "get_pending_edits"
    }

    fn description(&self) -> &str {
        "List the edits staged in this turn that have not been saved yet."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let edits: Vec<Value> = ctx
            .lease
            .pending()
            .iter()
            .map(|e| {
                json!({
                    "edit_id": e.edit_id,
                    "operation": e.operation,
                    "unit_index": e.unit_index,
                    "preview": e.preview,
                })
            })
            .collect();
        Ok(json!({ "count": edits.len(), "edits": edits }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::staging::AddUnitTool;
    use crate::tools::test_support::{lease_with_units, token};

    #[tokio::test]
    async fn list_units_strips_markup() {
        let (_store, lease) =
            lease_with_units(&["<h1>Intro</h1><p>Welcome   to the <b>review</b></p>", "b"]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        let out = ListUnitsTool.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(out["unit_count"], 2);
        assert_eq!(out["revision"], 1);
        assert_eq!(out["units"][0]["preview"], "Intro Welcome to the review");
        assert_eq!(out["units"][0]["has_notes"], false);
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = format!("<p>{}</p>", "x".repeat(250));
        let preview = text_preview(&long);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[tokio::test]
    async fn get_unit_reads_committed_content() {
        let (_store, lease) = lease_with_units(&["first", "second"]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        let out = GetUnitTool
            .execute(json!({"unit_index": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["content"], "second");

        let err = GetUnitTool
            .execute(json!({"unit_index": 2}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_target");
    }

    #[tokio::test]
    async fn pending_edits_reflect_staging() {
        let (_store, lease) = lease_with_units(&[]).await;
        let cancel = token();
        let ctx = TurnContext { lease: &lease, cancel: &cancel };

        let out = GetPendingEditsTool.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(out["count"], 0);

        AddUnitTool
            .execute(json!({"content": "hello"}), &ctx)
            .await
            .unwrap();
        let out = GetPendingEditsTool.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["edits"][0]["operation"], "ADD");

        let listed = ListUnitsTool.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(listed["unit_count"], 0);
        assert_eq!(listed["pending_count"], 1);
    }
}
