use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use folio_core::errors::RuntimeError;
use folio_core::ids::{ContinuationHandle, ToolCallId};
use folio_core::runtime::{AgentRuntime, RuntimeEvent, RuntimeRequest, RuntimeStream};
use folio_core::tools::ToolCall;

/// One pre-programmed runtime step for deterministic tests without API calls.
pub enum ScriptStep {
    /// Yield these events, then `Done` with the conversation handle.
    Events(Vec<RuntimeEvent>),
    /// Yield these events, then end the stream with an error.
    FailAfter(Vec<RuntimeEvent>, RuntimeError),
    /// Fail the submit call itself.
    Reject(RuntimeError),
    /// Wait a duration, then resolve the inner step.
    Delay(Duration, Box<ScriptStep>),
}

impl ScriptStep {
    /// A step that only says something.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![RuntimeEvent::AssistantText {
            text: text.to_string(),
        }])
    }

    /// A step that requests the given tool calls, in order.
    pub fn calls(calls: Vec<(&str, Value)>) -> Self {
        Self::Events(
            calls
                .into_iter()
                .map(|(name, arguments)| {
                    RuntimeEvent::ToolCall(ToolCall {
                        id: ToolCallId::new(),
                        name: name.to_string(),
                        arguments,
                    })
                })
                .collect(),
        )
    }

    pub fn delayed(delay: Duration, inner: ScriptStep) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Runtime that replays scripted steps in order and records every request.
pub struct ScriptedRuntime {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<RuntimeRequest>>,
    conversations: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            conversations: AtomicUsize::new(0),
        }
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<RuntimeRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().len()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: RuntimeRequest) -> Result<RuntimeStream, RuntimeError> {
        let handle = request.continuation.clone().unwrap_or_else(|| {
            let n = self.conversations.fetch_add(1, Ordering::Relaxed);
            ContinuationHandle::new(format!("scripted_conv_{n}"))
        });
        let call_index = {
            let mut requests = self.requests.lock();
            requests.push(request);
            requests.len() - 1
        };

        let mut step = self.steps.lock().pop_front().ok_or_else(|| {
            RuntimeError::InvalidRequest(format!(
                "ScriptedRuntime: no step configured for call {call_index}"
            ))
        })?;

        loop {
            match step {
                ScriptStep::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    step = *inner;
                }
                ScriptStep::Reject(error) => return Err(error),
                ScriptStep::Events(mut events) => {
                    events.push(RuntimeEvent::Done { handle });
                    return Ok(Box::pin(stream::iter(events)));
                }
                ScriptStep::FailAfter(mut events, error) => {
                    events.push(RuntimeEvent::Error(error));
                    return Ok(Box::pin(stream::iter(events)));
                }
            }
        }
    }
}
