use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use folio_core::errors::RuntimeError;
use folio_core::ids::ContinuationHandle;
use folio_core::runtime::{AgentRuntime, RuntimeEvent, RuntimeInput, RuntimeRequest, RuntimeStream};
use folio_core::tools::{ToolCall, ToolDefinition, ToolOutcome};

use crate::sse::{ChatChunkParser, SseBuffer};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const CONVERSATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Conversations untouched for longer than this are forgotten.
    pub conversation_ttl: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
            conversation_ttl: CONVERSATION_TTL,
        }
    }
}

struct Conversation {
    messages: Vec<Value>,
    last_used: Instant,
}

type Conversations = Arc<DashMap<String, Conversation>>;

/// Agent runtime backed by a streaming chat-completions endpoint.
///
/// The endpoint is stateless, so conversation history lives here, keyed by
/// the continuation handle. A step's messages are only recorded once the
/// step completes.
pub struct OpenAiRuntime {
    client: Client,
    config: OpenAiConfig,
    conversations: Conversations,
}

impl OpenAiRuntime {
    pub fn new(config: OpenAiConfig) -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| RuntimeError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            conversations: Arc::new(DashMap::new()),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Number of conversations currently held in memory.
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Forget conversations idle past the configured TTL. Returns how many
    /// were dropped.
    pub fn prune_idle(&self) -> usize {
        let ttl = self.config.conversation_ttl;
        let before = self.conversations.len();
        self.conversations
            .retain(|_, conversation| conversation.last_used.elapsed() < ttl);
        let pruned = before.saturating_sub(self.conversations.len());
        if pruned > 0 {
            info!(pruned, remaining = self.conversations.len(), "idle conversations pruned");
        }
        pruned
    }

    /// Resolve the handle and prior history for a request.
    fn resume(&self, request: &RuntimeRequest) -> Result<(ContinuationHandle, Vec<Value>), RuntimeError> {
        let Some(handle) = request.continuation.clone() else {
            let handle = ContinuationHandle::new(format!("conv_{}", uuid::Uuid::now_v7()));
            return Ok((handle, Vec::new()));
        };

        match self.conversations.get(handle.as_str()) {
            Some(conversation) => {
                let mut history = conversation.messages.clone();
                if matches!(request.input, RuntimeInput::Instructions(_)) {
                    drop_dangling_tool_calls(&mut history);
                }
                Ok((handle, history))
            }
            None => match request.input {
                RuntimeInput::Instructions(_) => {
                    warn!(handle = %handle, "unknown conversation handle, starting fresh");
                    Ok((handle, Vec::new()))
                }
                RuntimeInput::ToolResults(_) => Err(RuntimeError::UnknownHandle(handle.to_string())),
            },
        }
    }

    fn build_body(&self, request: &RuntimeRequest, messages: &[Value]) -> Value {
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(json!({"role": "system", "content": request.system_prompt}));
        all.extend(messages.iter().cloned());

        let mut body = json!({
            "model": self.config.model,
            "stream": true,
            "messages": all,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_schema).collect());
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl AgentRuntime for OpenAiRuntime {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, request), fields(model = %self.config.model))]
    async fn submit(&self, request: RuntimeRequest) -> Result<RuntimeStream, RuntimeError> {
        self.prune_idle();
        let (handle, mut messages) = self.resume(&request)?;
        messages.extend(input_messages(&request.input));

        let body = self.build_body(&request, &messages);
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let resp = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key.expose_secret()),
            )
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| RuntimeError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::from_status(status, body));
        }

        debug!(handle = %handle, messages = messages.len(), "chat stream opened");
        let completion = Completion {
            handle,
            messages,
            conversations: self.conversations.clone(),
        };
        Ok(Box::pin(ChatStream::with_idle_timeout(
            resp.bytes_stream(),
            completion,
            self.config.idle_timeout,
        )))
    }
}

fn tool_schema(def: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters_schema,
        }
    })
}

fn input_messages(input: &RuntimeInput) -> Vec<Value> {
    match input {
        RuntimeInput::Instructions(text) => vec![json!({"role": "user", "content": text})],
        RuntimeInput::ToolResults(outcomes) => outcomes.iter().map(tool_message).collect(),
    }
}

fn tool_message(outcome: &ToolOutcome) -> Value {
    json!({
        "role": "tool",
        "tool_call_id": outcome.tool_call_id.as_str(),
        "content": value_text(&outcome.content),
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// An assistant message whose tool calls never got results cannot be
/// followed by a user message. This happens when a turn fails mid-way.
fn drop_dangling_tool_calls(history: &mut Vec<Value>) {
    let dangling = history
        .last()
        .is_some_and(|m| m["role"] == "assistant" && m.get("tool_calls").is_some());
    if dangling {
        history.pop();
    }
}

/// State needed to record the conversation once the step finishes.
struct Completion {
    handle: ContinuationHandle,
    messages: Vec<Value>,
    conversations: Conversations,
}

impl Completion {
    fn record(mut self, text: &str, calls: &[ToolCall]) -> ContinuationHandle {
        let mut assistant = json!({
            "role": "assistant",
            "content": if text.is_empty() { Value::Null } else { Value::String(text.to_string()) },
        });
        if !calls.is_empty() {
            assistant["tool_calls"] = calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id.as_str(),
                        "type": "function",
                        "function": {"name": c.name, "arguments": value_text(&c.arguments)},
                    })
                })
                .collect();
        }
        self.messages.push(assistant);
        self.conversations.insert(
            self.handle.as_str().to_string(),
            Conversation {
                messages: self.messages,
                last_used: Instant::now(),
            },
        );
        self.handle
    }
}

/// Wraps the response byte stream and yields runtime events.
/// Emits a `StreamInterrupted` error if no data arrives within `idle_duration`.
struct ChatStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    sse: SseBuffer,
    parser: ChatChunkParser,
    pending: VecDeque<RuntimeEvent>,
    completion: Option<Completion>,
    finished: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl ChatStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        completion: Completion,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            sse: SseBuffer::new(),
            parser: ChatChunkParser::new(),
            pending: VecDeque::new(),
            completion: Some(completion),
            finished: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    fn absorb(&mut self, data: &str) {
        if self.finished {
            return;
        }
        for event in self.parser.parse(data) {
            if let RuntimeEvent::Error(_) = event {
                self.fail(event);
                return;
            }
            self.pending.push_back(event);
        }
        if self.parser.is_done() {
            self.complete();
        }
    }

    fn fail(&mut self, event: RuntimeEvent) {
        self.pending.push_back(event);
        self.completion = None;
        self.finished = true;
    }

    fn complete(&mut self) {
        let calls = self.parser.take_tool_calls();
        if let Some(completion) = self.completion.take() {
            let handle = completion.record(self.parser.text(), &calls);
            self.pending
                .extend(calls.into_iter().map(RuntimeEvent::ToolCall));
            self.pending.push_back(RuntimeEvent::Done { handle });
        }
        self.finished = true;
    }
}

impl Stream for ChatStream {
    type Item = RuntimeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    for data in self.sse.push(&chunk) {
                        self.absorb(&data);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.fail(RuntimeEvent::Error(RuntimeError::StreamInterrupted(
                        e.to_string(),
                    )));
                }
                Poll::Ready(None) => {
                    if let Some(data) = self.sse.finish() {
                        self.absorb(&data);
                    }
                    // Some servers close without the [DONE] sentinel.
                    if !self.finished {
                        self.complete();
                    }
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs();
                        self.fail(RuntimeEvent::Error(RuntimeError::StreamInterrupted(
                            format!("idle timeout after {secs}s"),
                        )));
                        continue;
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use folio_core::ids::ToolCallId;
    use futures::StreamExt;
    use parking_lot::Mutex;

    #[derive(Clone)]
    struct MockApi {
        bodies: Arc<Mutex<Vec<Value>>>,
        replies: Arc<Mutex<VecDeque<(StatusCode, String)>>>,
    }

    async fn completions(State(api): State<MockApi>, Json(body): Json<Value>) -> impl IntoResponse {
        api.bodies.lock().push(body);
        let (status, reply) = api
            .replies
            .lock()
            .pop_front()
            .unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, "no reply".into()));
        (status, [(header::CONTENT_TYPE, "text/event-stream")], reply)
    }

    async fn spawn_api(replies: Vec<(StatusCode, String)>) -> (String, MockApi) {
        let api = MockApi {
            bodies: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::new(Mutex::new(replies.into())),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v1"), api)
    }

    fn runtime(base_url: String) -> OpenAiRuntime {
        let mut config = OpenAiConfig::new(SecretString::from("sk-test"));
        config.base_url = base_url;
        OpenAiRuntime::new(config).unwrap()
    }

    fn request(input: RuntimeInput, continuation: Option<ContinuationHandle>) -> RuntimeRequest {
        RuntimeRequest {
            system_prompt: "You edit decks.".into(),
            input,
            tools: vec![ToolDefinition {
                name: "add_unit".into(),
                description: "Stage a new slide".into(),
                parameters_schema: json!({"type": "object"}),
            }],
            continuation,
        }
    }

    fn sse(chunks: &[&str]) -> String {
        chunks.iter().map(|c| format!("data: {c}\n\n")).collect()
    }

    #[tokio::test]
    async fn streams_tool_calls_and_records_history() {
        let first = sse(&[
            r#"{"choices":[{"delta":{"content":"Adding a title."}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"add_unit","arguments":"{\"content\":\"Hi\"}"}}]}}]}"#,
            "[DONE]",
        ]);
        let second = sse(&[r#"{"choices":[{"delta":{"content":"Done."}}]}"#, "[DONE]"]);
        let (url, api) = spawn_api(vec![(StatusCode::OK, first), (StatusCode::OK, second)]).await;
        let rt = runtime(url);

        let events: Vec<_> = rt
            .submit(request(RuntimeInput::Instructions("title slide".into()), None))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], RuntimeEvent::AssistantText { text } if text == "Adding a title."));
        assert!(matches!(&events[1], RuntimeEvent::ToolCall(c) if c.name == "add_unit" && c.arguments["content"] == "Hi"));
        let RuntimeEvent::Done { handle } = &events[2] else {
            panic!("expected done, got {:?}", events[2]);
        };
        assert_eq!(rt.conversation_count(), 1);

        let outcome = ToolOutcome {
            tool_call_id: ToolCallId::from_raw("call_1"),
            name: "add_unit".into(),
            content: json!({"staged": true}),
            is_error: false,
            duration: Duration::ZERO,
        };
        let events: Vec<_> = rt
            .submit(request(RuntimeInput::ToolResults(vec![outcome]), Some(handle.clone())))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events.last(), Some(RuntimeEvent::Done { handle: h }) if h == handle));

        let bodies = api.bodies.lock();
        assert_eq!(bodies[0]["stream"], true);
        assert_eq!(bodies[0]["tool_choice"], "auto");
        assert_eq!(bodies[0]["tools"][0]["function"]["name"], "add_unit");
        let messages = bodies[1]["messages"].as_array().unwrap();
        let roles: Vec<_> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    #[tokio::test]
    async fn http_errors_are_classified() {
        let (url, _) = spawn_api(vec![(StatusCode::UNAUTHORIZED, "bad key".into())]).await;
        let rt = runtime(url);
        let result = rt
            .submit(request(RuntimeInput::Instructions("hi".into()), None))
            .await;
        assert!(matches!(result, Err(RuntimeError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn unknown_handle_with_tool_results_is_rejected() {
        let rt = runtime("http://127.0.0.1:9".into());
        let result = rt
            .submit(request(
                RuntimeInput::ToolResults(Vec::new()),
                Some(ContinuationHandle::new("conv_gone")),
            ))
            .await;
        assert!(matches!(result, Err(RuntimeError::UnknownHandle(h)) if h == "conv_gone"));
    }

    #[tokio::test]
    async fn unknown_handle_with_instructions_starts_fresh() {
        let (url, api) = spawn_api(vec![(StatusCode::OK, sse(&["[DONE]"]))]).await;
        let rt = runtime(url);
        let handle = ContinuationHandle::new("conv_restarted");
        let events: Vec<_> = rt
            .submit(request(RuntimeInput::Instructions("again".into()), Some(handle.clone())))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events.last(), Some(RuntimeEvent::Done { handle: h }) if *h == handle));
        assert_eq!(api.bodies.lock()[0]["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn dangling_tool_calls_are_dropped() {
        let mut history = vec![
            json!({"role": "user", "content": "go"}),
            json!({"role": "assistant", "content": null, "tool_calls": [{"id": "c"}]}),
        ];
        drop_dangling_tool_calls(&mut history);
        assert_eq!(history.len(), 1);
        drop_dangling_tool_calls(&mut history);
        assert_eq!(history.len(), 1);
    }

    fn completion() -> Completion {
        Completion {
            handle: ContinuationHandle::new("conv_t"),
            messages: Vec::new(),
            conversations: Arc::new(DashMap::new()),
        }
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut stream = Box::pin(ChatStream::with_idle_timeout(
            byte_stream,
            completion(),
            Duration::from_secs(5),
        ));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(RuntimeEvent::Error(RuntimeError::StreamInterrupted(msg))) if msg.contains("idle timeout")),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, reqwest::Error>>(16);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = Box::pin(ChatStream::with_idle_timeout(
            rx_stream,
            completion(),
            Duration::from_secs(5),
        ));

        tx.send(Ok(Bytes::from(r#"data: {"choices":[{"delta":{"content":"a"}}]}"#.to_string() + "\n\n")))
            .await
            .unwrap();
        let _ = stream.next().await;

        tokio::time::advance(Duration::from_secs(4)).await;

        tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await.unwrap();
        let event = stream.next().await;
        assert!(matches!(event, Some(RuntimeEvent::Done { .. })), "got {event:?}");

        drop(tx);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn config_defaults() {
        let config = OpenAiConfig::new(SecretString::from("k"));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.idle_timeout, SSE_IDLE_TIMEOUT);
        assert_eq!(config.conversation_ttl, CONVERSATION_TTL);
    }

    fn record_into(rt: &OpenAiRuntime, handle: &str) {
        Completion {
            handle: ContinuationHandle::new(handle),
            messages: vec![json!({"role": "user", "content": "hi"})],
            conversations: rt.conversations.clone(),
        }
        .record("hello", &[]);
    }

    #[test]
    fn idle_conversations_are_pruned() {
        let mut config = OpenAiConfig::new(SecretString::from("k"));
        config.conversation_ttl = Duration::ZERO;
        let rt = OpenAiRuntime::new(config).unwrap();
        record_into(&rt, "conv_a");
        record_into(&rt, "conv_b");
        assert_eq!(rt.conversation_count(), 2);

        assert_eq!(rt.prune_idle(), 2);
        assert_eq!(rt.conversation_count(), 0);
    }

    #[test]
    fn recent_conversations_survive_pruning() {
        let rt = runtime("http://127.0.0.1:9".into());
        record_into(&rt, "conv_a");
        assert_eq!(rt.prune_idle(), 0);
        assert_eq!(rt.conversation_count(), 1);
    }
}
