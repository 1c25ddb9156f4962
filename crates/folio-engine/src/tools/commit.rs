use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use folio_core::tools::ExecutionMode;

use crate::error::ToolError;
use crate::registry::{Tool, TurnContext};

/// Applies every staged edit atomically and saves the result.
pub struct CommitEditsTool;

#[async_trait]
impl Tool for CommitEditsTool {
    fn name(&self) -> &str {
        "commit_edits"
    }

    fn description(&self) -> &str {
        "Apply all staged edits to the document and save it. Edits are applied together or not at all."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, _args: Value, ctx: &TurnContext<'_>) -> Result<Value, ToolError> {
        let result = ctx.lease.commit()?;
        ctx.lease.persist()?;
        info!(
            session_id = %ctx.lease.session_id(),
            applied = result.applied.len(),
            revision = result.revision,
            "edits committed"
        );
        Ok(json!({
            "applied_count": result.applied.len(),
            "revision": result.revision,
        }))
    }
}
