use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;

/// Tools declare whether they can run in parallel with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Safe to run alongside other calls from the same response (staging, reads).
    Concurrent,
    /// Acts as a barrier: runs alone, after everything before it (commit).
    Sequential,
}

/// Tool definition handed to the agent runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// A tool invocation requested by the agent runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: Value,
}

/// Result of one tool call, fed back to the runtime on the next step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_call_id: ToolCallId,
    pub name: String,
    pub content: Value,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolOutcome {
    pub fn error(call: &ToolCall, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: serde_json::json!({ "error": message.into() }),
            is_error: true,
            duration,
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_mode_serde() {
        let json = serde_json::to_string(&ExecutionMode::Concurrent).unwrap();
        assert_eq!(json, r#""concurrent""#);
        let json = serde_json::to_string(&ExecutionMode::Sequential).unwrap();
        assert_eq!(json, r#""sequential""#);
    }

    #[test]
    fn outcome_duration_serializes_as_ms() {
        let outcome = ToolOutcome {
            tool_call_id: ToolCallId::from_raw("call_1"),
            name: "list_units".into(),
            content: json!({"count": 0}),
            is_error: false,
            duration: Duration::from_millis(1234),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["duration"], 1234);
    }

    #[test]
    fn error_outcome_wraps_message() {
        let call = ToolCall {
            id: ToolCallId::from_raw("call_2"),
            name: "delete_unit".into(),
            arguments: json!({"unit_index": 9}),
        };
        let outcome = ToolOutcome::error(&call, "unit 9 out of range", Duration::ZERO);
        assert!(outcome.is_error);
        assert_eq!(outcome.content["error"], "unit 9 out of range");
        assert_eq!(outcome.tool_call_id, call.id);
    }
}
