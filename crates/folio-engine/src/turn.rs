//! Turn orchestration.
//!
//! Each turn runs as its own task: resolve the session, take its lease, drive
//! the agent runtime step by step, dispatch the requested tool calls, then
//! commit and persist. Progress goes out on the turn's [`TurnStream`], which
//! always ends with exactly one `commit_complete` or `error` event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use folio_core::document::{ContextFile, StyleTemplate};
use folio_core::errors::RuntimeError;
use folio_core::events::TurnEvent;
use folio_core::ids::{ContinuationHandle, ContinuationToken, SessionId, TurnId};
use folio_core::runtime::{AgentRuntime, RuntimeEvent, RuntimeInput, RuntimeRequest};
use folio_core::tools::{ExecutionMode, ToolCall, ToolOutcome};

use crate::continuation::ContinuationResolver;
use crate::describe;
use crate::error::EngineError;
use crate::multiplexer::{self, EventSink, StreamConfig, TurnStream};
use crate::prompts;
use crate::registry::{ToolRegistry, TurnContext};
use crate::session_store::{Lease, SessionStore};

const DEFAULT_MAX_STEPS: u32 = 25;
const DEFAULT_MAX_PARALLEL_TOOLS: usize = 8;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct TurnConfig {
    /// Runtime round trips allowed per turn.
    pub max_steps: u32,
    /// Concurrent tool calls from one runtime response.
    pub max_parallel_tools: usize,
    pub tool_timeout: Duration,
    /// Lease wait for turns. `None` uses the session store's setting.
    pub lease_timeout: Option<Duration>,
    pub stream: StreamConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_parallel_tools: DEFAULT_MAX_PARALLEL_TOOLS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            lease_timeout: None,
            stream: StreamConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    pub instructions: String,
    #[serde(default)]
    pub is_continuation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<ContinuationToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Replaces the session's context files when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_files: Option<Vec<ContextFile>>,
    /// Replaces the session's style template when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_template: Option<StyleTemplate>,
}

impl TurnRequest {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            ..Default::default()
        }
    }

    /// Continue an existing session on its stored runtime handle.
    pub fn continuing(mut self, session_id: SessionId) -> Self {
        self.is_continuation = true;
        self.session_id = Some(session_id);
        self
    }

    /// Continue from a previously issued token.
    pub fn with_token(mut self, token: ContinuationToken) -> Self {
        self.is_continuation = true;
        self.continuation_token = Some(token);
        self
    }

    pub fn with_context_files(mut self, files: Vec<ContextFile>) -> Self {
        self.context_files = Some(files);
        self
    }

    pub fn with_style_template(mut self, template: StyleTemplate) -> Self {
        self.style_template = Some(template);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Init,
    Running,
    Committing,
    Completed,
    Failed,
    Cancelled,
}

/// Public view of an in-flight turn.
#[derive(Clone, Debug, Serialize)]
pub struct ActiveTurnInfo {
    pub turn_id: TurnId,
    pub phase: TurnPhase,
    pub started_at: DateTime<Utc>,
}

struct ActiveTurn {
    turn_id: TurnId,
    phase: Arc<Mutex<TurnPhase>>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Starts turns and tracks the ones in flight.
pub struct TurnOrchestrator {
    runtime: Arc<dyn AgentRuntime>,
    store: Arc<SessionStore>,
    registry: Arc<ToolRegistry>,
    resolver: ContinuationResolver,
    config: TurnConfig,
    active: Arc<DashMap<SessionId, ActiveTurn>>,
}

impl TurnOrchestrator {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<SessionStore>,
        registry: Arc<ToolRegistry>,
        resolver: ContinuationResolver,
        config: TurnConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            registry,
            resolver,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Spawn a turn and return its event stream.
    ///
    /// Dropping the stream cancels the turn at its next dispatch boundary.
    pub fn start(&self, request: TurnRequest) -> TurnStream {
        let turn_id = TurnId::new();
        let cancel = CancellationToken::new();
        let (sink, stream) = multiplexer::channel(&self.config.stream, cancel.clone());

        let task = TurnTask {
            runtime: Arc::clone(&self.runtime),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            resolver: self.resolver.clone(),
            config: self.config.clone(),
            active: Arc::clone(&self.active),
            turn_id: turn_id.clone(),
            cancel,
            phase: Arc::new(Mutex::new(TurnPhase::Init)),
        };
        let span = info_span!("turn", turn_id = %turn_id);
        drop(tokio::spawn(task.run(request, sink).instrument(span)));
        stream
    }

    /// Cancel the in-flight turn of a session. Returns false if none is running.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.active.get(session_id) {
            Some(turn) => {
                info!(session_id = %session_id, turn_id = %turn.turn_id, "turn cancel requested");
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight turn. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for turn in self.active.iter() {
            turn.cancel.cancel();
            count += 1;
        }
        count
    }

    pub fn active_turn(&self, session_id: &SessionId) -> Option<ActiveTurnInfo> {
        self.active.get(session_id).map(|turn| ActiveTurnInfo {
            turn_id: turn.turn_id.clone(),
            phase: *turn.phase.lock(),
            started_at: turn.started_at,
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Removes a turn from the active map when it ends.
struct Registration {
    active: Arc<DashMap<SessionId, ActiveTurn>>,
    session_id: SessionId,
    turn_id: TurnId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let turn_id = &self.turn_id;
        let _ = self
            .active
            .remove_if(&self.session_id, |_, turn| &turn.turn_id == turn_id);
    }
}

struct StepOutput {
    calls: Vec<ToolCall>,
    handle: ContinuationHandle,
}

struct CallResult {
    outcome: ToolOutcome,
    /// Set when the failure must end the turn.
    fatal: Option<EngineError>,
}

impl CallResult {
    fn ok(outcome: ToolOutcome) -> Self {
        Self {
            outcome,
            fatal: None,
        }
    }
}

struct TurnTask {
    runtime: Arc<dyn AgentRuntime>,
    store: Arc<SessionStore>,
    registry: Arc<ToolRegistry>,
    resolver: ContinuationResolver,
    config: TurnConfig,
    active: Arc<DashMap<SessionId, ActiveTurn>>,
    turn_id: TurnId,
    cancel: CancellationToken,
    phase: Arc<Mutex<TurnPhase>>,
}

impl TurnTask {
    async fn run(self, request: TurnRequest, mut sink: EventSink) {
        let started = Instant::now();
        let is_continuation = request.is_continuation || request.continuation_token.is_some();

        let (lease, handle) = match self.begin(&request, is_continuation).await {
            Ok(begun) => begun,
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "turn rejected");
                let session_id = session_of(&e).or_else(|| request.session_id.clone());
                *self.phase.lock() = if matches!(e, EngineError::Cancelled) {
                    TurnPhase::Cancelled
                } else {
                    TurnPhase::Failed
                };
                let _ = sink.send(error_event(&e, session_id)).await;
                return;
            }
        };

        let session_id = lease.session_id().clone();
        sink.bind_session(session_id.clone());
        self.active.insert(
            session_id.clone(),
            ActiveTurn {
                turn_id: self.turn_id.clone(),
                phase: Arc::clone(&self.phase),
                cancel: self.cancel.clone(),
                started_at: Utc::now(),
            },
        );
        let registration = Registration {
            active: Arc::clone(&self.active),
            session_id: session_id.clone(),
            turn_id: self.turn_id.clone(),
        };

        let start_history = lease.history_len();
        let revision = lease.document().revision;
        info!(session_id = %session_id, is_continuation, revision, "turn started");
        let _ = sink
            .send(TurnEvent::Init {
                session_id: session_id.clone(),
                turn_id: self.turn_id.clone(),
                is_continuation,
                revision,
            })
            .await;

        let terminal = match self
            .drive(&lease, &mut sink, &request, is_continuation, handle)
            .await
        {
            Ok(handle) => self.complete(lease, handle, start_history),
            Err(e) => self.abort(lease, e),
        };
        drop(registration);

        debug!(
            session_id = %session_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn finished"
        );
        let _ = sink.send(terminal).await;
    }

    /// `init`: resolve the token and session, then take the lease.
    async fn begin(
        &self,
        request: &TurnRequest,
        is_continuation: bool,
    ) -> Result<(Lease, Option<ContinuationHandle>), EngineError> {
        let resolved = match &request.continuation_token {
            Some(token) => Some(self.resolver.resolve(token, request.session_id.as_ref())?),
            None => None,
        };
        let session_id = match &resolved {
            Some(r) => self.store.snapshot(&r.session_id)?.session_id().clone(),
            None => self
                .store
                .get_or_create(request.session_id.as_ref())?
                .session_id()
                .clone(),
        };

        let timeout = self
            .config
            .lease_timeout
            .unwrap_or(self.store.config().lease_timeout);
        let lease = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            lease = self.store.acquire_exclusive(&session_id, &self.turn_id, timeout) => lease?,
        };

        let handle = if is_continuation {
            let handle = resolved
                .map(|r| r.handle)
                .or_else(|| lease.continuation_handle());
            if handle.is_none() {
                warn!(session_id = %session_id, "continuation without a runtime handle; starting a new conversation");
            }
            handle
        } else {
            None
        };

        if let Some(files) = &request.context_files {
            lease.set_context_files(files.clone());
        }
        if let Some(template) = &request.style_template {
            lease.set_style_template(template.clone());
        }
        Ok((lease, handle))
    }

    /// `running` and `committing`. Returns the final runtime handle.
    async fn drive(
        &self,
        lease: &Lease,
        sink: &mut EventSink,
        request: &TurnRequest,
        is_continuation: bool,
        mut handle: Option<ContinuationHandle>,
    ) -> Result<ContinuationHandle, EngineError> {
        self.set_phase(TurnPhase::Running);
        let system_prompt = prompts::build_system_prompt(
            is_continuation,
            &lease.context_files(),
            lease.style_template().as_ref(),
        );
        let tools = self.registry.definitions();
        let mut input = RuntimeInput::Instructions(request.instructions.clone());

        for step in 1..=self.config.max_steps {
            self.check_cancelled()?;
            let _ = sink.send(TurnEvent::status("Thinking...")).await;

            let output = self
                .run_step(
                    sink,
                    RuntimeRequest {
                        system_prompt: system_prompt.clone(),
                        input,
                        tools: tools.clone(),
                        continuation: handle.clone(),
                    },
                )
                .await?;
            debug!(step, tool_calls = output.calls.len(), "runtime step finished");

            if output.calls.is_empty() {
                self.commit_remaining(lease)?;
                return Ok(output.handle);
            }
            handle = Some(output.handle);

            let _ = sink.send(TurnEvent::status("Executing tools...")).await;
            let outcomes = self.dispatch(lease, sink, &output.calls).await?;
            input = RuntimeInput::ToolResults(outcomes);
        }

        Err(EngineError::MaxStepsExceeded(self.config.max_steps))
    }

    /// Submit one request and drain the runtime's reply.
    async fn run_step(
        &self,
        sink: &mut EventSink,
        request: RuntimeRequest,
    ) -> Result<StepOutput, EngineError> {
        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            stream = self.runtime.submit(request) => stream?,
        };

        let mut calls = Vec::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                event = stream.next() => event,
            };
            match event {
                Some(RuntimeEvent::AssistantText { text }) => {
                    let _ = sink.send(TurnEvent::AssistantText { text }).await;
                }
                Some(RuntimeEvent::ToolCall(call)) => calls.push(call),
                Some(RuntimeEvent::Done { handle }) => return Ok(StepOutput { calls, handle }),
                Some(RuntimeEvent::Error(e)) => return Err(e.into()),
                None => {
                    return Err(RuntimeError::StreamInterrupted(
                        "runtime stream ended without completing the step".into(),
                    )
                    .into())
                }
            }
        }
    }

    /// Run one response's tool calls. Sequential tools split the list into
    /// batches; calls inside a batch run concurrently and report in call order.
    async fn dispatch(
        &self,
        lease: &Lease,
        sink: &mut EventSink,
        calls: &[ToolCall],
    ) -> Result<Vec<ToolOutcome>, EngineError> {
        let limit = self.config.max_parallel_tools.max(1);
        let mut outcomes = Vec::with_capacity(calls.len());

        for batch in split_batches(&self.registry, calls) {
            self.check_cancelled()?;

            for call in batch {
                let (friendly, details) = describe::describe(&call.name, &call.arguments);
                let _ = sink
                    .send(TurnEvent::ToolCall {
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        friendly,
                        details,
                    })
                    .await;
            }

            let pending: Vec<_> = batch.iter().map(|call| self.execute_call(lease, call)).collect();
            let results: Vec<CallResult> = futures::stream::iter(pending)
                .buffered(limit)
                .collect()
                .await;

            let mut fatal = None;
            for result in results {
                let outcome = result.outcome;
                let _ = sink
                    .send(TurnEvent::ToolResult {
                        tool_call_id: outcome.tool_call_id.clone(),
                        name: outcome.name.clone(),
                        is_error: outcome.is_error,
                        content: outcome.content.clone(),
                        duration_ms: outcome.duration.as_millis() as u64,
                    })
                    .await;
                outcomes.push(outcome);
                if fatal.is_none() {
                    fatal = result.fatal;
                }
            }
            if let Some(e) = fatal {
                return Err(e);
            }
        }

        Ok(outcomes)
    }

    async fn execute_call(&self, lease: &Lease, call: &ToolCall) -> CallResult {
        let start = Instant::now();
        let tool = match self.registry.resolve(call) {
            Ok(tool) => tool,
            Err(e) => {
                debug!(tool = %call.name, error = %e, "tool call rejected");
                return CallResult::ok(ToolOutcome::error(call, e.to_string(), start.elapsed()));
            }
        };

        let ctx = TurnContext {
            lease,
            cancel: &self.cancel,
        };
        let result = tokio::time::timeout(
            self.config.tool_timeout,
            AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind(),
        )
        .await;
        let duration = start.elapsed();

        match result {
            Ok(Ok(Ok(content))) => CallResult::ok(ToolOutcome {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content,
                is_error: false,
                duration,
            }),
            Ok(Ok(Err(e))) if e.is_recoverable() => {
                debug!(tool = %call.name, kind = e.error_kind(), error = %e, "tool error returned to runtime");
                CallResult::ok(ToolOutcome::error(call, e.to_string(), duration))
            }
            Ok(Ok(Err(e))) => {
                warn!(tool = %call.name, kind = e.error_kind(), error = %e, "tool error ends turn");
                CallResult {
                    outcome: ToolOutcome::error(call, e.to_string(), duration),
                    fatal: Some(e.into()),
                }
            }
            Ok(Err(panic)) => {
                error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked during execution");
                CallResult::ok(ToolOutcome::error(call, "internal error: tool crashed", duration))
            }
            Err(_) => {
                warn!(
                    tool = %call.name,
                    timeout_secs = self.config.tool_timeout.as_secs(),
                    "tool timed out"
                );
                CallResult::ok(ToolOutcome::error(
                    call,
                    format!("tool timed out after {}s", self.config.tool_timeout.as_secs()),
                    duration,
                ))
            }
        }
    }

    /// Commit edits the runtime staged but never committed.
    fn commit_remaining(&self, lease: &Lease) -> Result<(), EngineError> {
        self.check_cancelled()?;
        self.set_phase(TurnPhase::Committing);
        if lease.pending().is_empty() {
            return Ok(());
        }
        let result = lease.commit()?;
        info!(
            applied = result.applied.len(),
            revision = result.revision,
            "staged edits committed at end of turn"
        );
        Ok(())
    }

    /// `completed`: persist, release, and build `commit_complete`.
    fn complete(&self, lease: Lease, handle: ContinuationHandle, start_history: usize) -> TurnEvent {
        lease.set_continuation_handle(handle.clone());
        if let Err(e) = lease.persist() {
            return self.abort(lease, e.into());
        }

        let session_id = lease.session_id().clone();
        let revision = lease.document().revision;
        let applied_count = lease.history_len().saturating_sub(start_history);
        let continuation_token = match self.resolver.issue(&session_id, &handle, revision) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to issue continuation token");
                None
            }
        };

        self.set_phase(TurnPhase::Completed);
        drop(lease);
        info!(session_id = %session_id, applied_count, revision, "turn completed");
        TurnEvent::CommitComplete {
            session_id,
            applied_count,
            revision,
            continuation_token,
        }
    }

    /// `failed` / `cancelled`: discard staged edits, keep what was committed.
    fn abort(&self, lease: Lease, error: EngineError) -> TurnEvent {
        let cancelled = matches!(error, EngineError::Cancelled);
        self.set_phase(if cancelled {
            TurnPhase::Cancelled
        } else {
            TurnPhase::Failed
        });

        let session_id = lease.session_id().clone();
        let discarded = lease.discard_pending();
        if let Err(e) = lease.persist() {
            error!(session_id = %session_id, error = %e, "failed to persist session after aborted turn");
        }
        drop(lease);

        if cancelled {
            info!(session_id = %session_id, discarded, "turn cancelled");
        } else if let EngineError::Runtime(e) = &error {
            warn!(
                session_id = %session_id,
                error = %e,
                runtime_kind = e.error_kind(),
                retryable = e.is_retryable(),
                discarded,
                "turn failed in runtime"
            );
        } else {
            warn!(
                session_id = %session_id,
                error = %error,
                kind = error.error_kind(),
                discarded,
                "turn failed"
            );
        }
        error_event(&error, Some(session_id))
    }

    fn set_phase(&self, phase: TurnPhase) {
        *self.phase.lock() = phase;
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Split a response's calls at sequential tools. Each sequential call forms
/// its own batch; runs of concurrent calls between them share one.
fn split_batches<'c>(registry: &ToolRegistry, calls: &'c [ToolCall]) -> Vec<&'c [ToolCall]> {
    let mut batches = Vec::new();
    let mut start = 0;
    for (i, call) in calls.iter().enumerate() {
        if registry.mode_of(&call.name) == ExecutionMode::Sequential {
            if start < i {
                batches.push(&calls[start..i]);
            }
            batches.push(&calls[i..=i]);
            start = i + 1;
        }
    }
    if start < calls.len() {
        batches.push(&calls[start..]);
    }
    batches
}

fn error_event(error: &EngineError, session_id: Option<SessionId>) -> TurnEvent {
    TurnEvent::Error {
        error: error.to_string(),
        kind: error.error_kind().to_string(),
        session_id,
        edit_id: error.edit_id().cloned(),
    }
}

fn session_of(error: &EngineError) -> Option<SessionId> {
    match error {
        EngineError::SessionBusy { session_id, .. }
        | EngineError::SessionCorrupt { session_id, .. }
        | EngineError::SessionNotFound(session_id) => Some(session_id.clone()),
        _ => None,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
