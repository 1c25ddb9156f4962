use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::RuntimeError;
use crate::ids::ContinuationHandle;
use crate::tools::{ToolCall, ToolDefinition, ToolOutcome};

/// What the runtime is asked to react to on one step.
#[derive(Clone, Debug)]
pub enum RuntimeInput {
    /// The user's instructions that open a turn.
    Instructions(String),
    /// Results of the tool calls requested on the previous step.
    ToolResults(Vec<ToolOutcome>),
}

#[derive(Clone, Debug)]
pub struct RuntimeRequest {
    pub system_prompt: String,
    pub input: RuntimeInput,
    pub tools: Vec<ToolDefinition>,
    /// Conversation to continue. `None` opens a new one.
    pub continuation: Option<ContinuationHandle>,
}

/// Events a runtime yields for one step. Ordering contract:
///
/// (AssistantText | ToolCall)* → Done
///
/// Error may replace Done at any point.
#[derive(Clone, Debug)]
pub enum RuntimeEvent {
    AssistantText { text: String },
    ToolCall(ToolCall),
    /// Step finished. `handle` names the conversation including this step.
    Done { handle: ContinuationHandle },
    Error(RuntimeError),
}

impl RuntimeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}

pub type RuntimeStream = Pin<Box<dyn Stream<Item = RuntimeEvent> + Send>>;

/// External agent runtime that turns instructions into tool calls.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, request: RuntimeRequest) -> Result<RuntimeStream, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        let done = RuntimeEvent::Done {
            handle: ContinuationHandle::new("conv_1"),
        };
        assert!(done.is_terminal());
        assert!(RuntimeEvent::Error(RuntimeError::RateLimited).is_terminal());
        assert!(!RuntimeEvent::AssistantText { text: "hi".into() }.is_terminal());
    }
}
