use bytes::BytesMut;
use serde::Deserialize;

use folio_core::errors::RuntimeError;
use folio_core::ids::ToolCallId;
use folio_core::runtime::RuntimeEvent;
use folio_core::tools::ToolCall;

/// Splits a byte stream into SSE events and yields their `data:` payloads.
///
/// Bytes are held until a full line arrives, so a character split across
/// network chunks is decoded whole.
#[derive(Default)]
pub struct SseBuffer {
    buffer: BytesMut,
    data: Vec<String>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the data payloads of every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if let Some(payload) = self.feed_line(&String::from_utf8_lossy(&line)) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        if !rest.is_empty() {
            let line = String::from_utf8_lossy(&rest);
            self.feed_line(line.trim_end_matches('\r'));
        }
        self.take_event()
    }

    /// Collect `data:` lines. A blank line ends the event. Comments and other
    /// fields are ignored.
    fn feed_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.take_event();
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        None
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data).join("\n"))
        }
    }
}

/// Accumulates OpenAI-style chat completion chunks into runtime events.
///
/// Text deltas are yielded as they arrive. Tool calls are buffered by their
/// stream index and released in index order once the step ends.
#[derive(Default)]
pub struct ChatChunkParser {
    text: String,
    tool_calls: Vec<PartialToolCall>,
    done: bool,
}

#[derive(Default)]
struct PartialToolCall {
    index: usize,
    id: String,
    name: String,
    arguments: String,
}

impl ChatChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Parse one `data:` payload.
    pub fn parse(&mut self, data: &str) -> Vec<RuntimeEvent> {
        if data.trim() == "[DONE]" {
            self.done = true;
            return Vec::new();
        }

        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                return vec![RuntimeEvent::Error(RuntimeError::StreamInterrupted(format!(
                    "malformed chunk: {e}"
                )))]
            }
        };

        if let Some(error) = chunk.error {
            return vec![RuntimeEvent::Error(RuntimeError::ServerError {
                status: 500,
                body: error.message,
            })];
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.text.push_str(&content);
                events.push(RuntimeEvent::AssistantText { text: content });
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                self.merge_tool_delta(delta);
            }
        }
        events
    }

    fn merge_tool_delta(&mut self, delta: ToolCallDelta) {
        let slot = match self.tool_calls.iter().position(|c| c.index == delta.index) {
            Some(pos) => &mut self.tool_calls[pos],
            None => {
                self.tool_calls.push(PartialToolCall {
                    index: delta.index,
                    ..Default::default()
                });
                let last = self.tool_calls.len() - 1;
                &mut self.tool_calls[last]
            }
        };
        if let Some(id) = delta.id {
            slot.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                slot.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                slot.arguments.push_str(&arguments);
            }
        }
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Completed tool calls in index order. Unparseable arguments are kept as a
    /// raw string so the core can report them as an invalid operation.
    pub fn take_tool_calls(&mut self) -> Vec<ToolCall> {
        let mut partials = std::mem::take(&mut self.tool_calls);
        partials.sort_by_key(|c| c.index);
        partials
            .into_iter()
            .map(|c| {
                let arguments = if c.arguments.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&c.arguments)
                        .unwrap_or(serde_json::Value::String(c.arguments))
                };
                let id = if c.id.is_empty() {
                    ToolCallId::new()
                } else {
                    ToolCallId::from_raw(c.id)
                };
                ToolCall {
                    id,
                    name: c.name,
                    arguments,
                }
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: String,
}
