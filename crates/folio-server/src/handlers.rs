//! HTTP handlers. Session reads go through snapshots and never wait on a
//! turn's lease.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{info, warn};

use folio_core::ids::SessionId;
use folio_engine::session_store::LockState;
use folio_engine::{TurnOrchestrator, TurnRequest};

use crate::error::ApiError;

/// Shared state available to all handlers.
pub struct HandlerState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub keep_alive: Duration,
}

impl HandlerState {
    pub fn new(orchestrator: Arc<TurnOrchestrator>, keep_alive: Duration) -> Self {
        Self {
            orchestrator,
            keep_alive,
        }
    }
}

/// `POST /v1/turns`: start a turn and stream its events as SSE frames.
pub async fn create_turn(
    State(state): State<Arc<HandlerState>>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.instructions.trim().is_empty() {
        return Err(ApiError::bad_request("instructions must not be empty"));
    }
    info!(
        session_id = ?request.session_id,
        is_continuation = request.is_continuation,
        "turn requested"
    );

    let events = state.orchestrator.start(request).map(|event| {
        let frame = match serde_json::to_string(&event) {
            Ok(json) => Event::default().data(json),
            Err(e) => {
                warn!(sequence = event.sequence, error = %e, "failed to serialize stream event");
                Event::default().comment("serialization failure")
            }
        };
        Ok(frame)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

/// `GET /v1/sessions/{id}`: last committed document and lock state.
pub async fn get_session(
    State(state): State<Arc<HandlerState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    let snapshot = state.orchestrator.store().snapshot(&session_id)?;
    let lock = match &snapshot.lock {
        LockState::Free => json!({ "state": "free" }),
        LockState::Held(turn_id) => json!({ "state": "held", "turn_id": turn_id }),
    };
    let s = &snapshot.state;
    Ok(Json(json!({
        "session_id": s.session_id,
        "revision": s.document.revision,
        "document": s.document,
        "lock": lock,
        "active_turn": state.orchestrator.active_turn(&session_id),
        "context_files": s.context_files.iter().map(|f| &f.filename).collect::<Vec<_>>(),
        "style_template": s.style_template.as_ref().map(|t| &t.filename),
        "created_at": s.created_at.to_rfc3339(),
        "updated_at": s.updated_at.to_rfc3339(),
    })))
}

/// `GET /v1/sessions/{id}/history`: applied edits, oldest first.
pub async fn get_history(
    State(state): State<Arc<HandlerState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    let edits = state.orchestrator.store().history(&session_id)?;
    Ok(Json(json!({
        "session_id": session_id,
        "count": edits.len(),
        "edits": edits,
    })))
}

/// `POST /v1/sessions/{id}/cancel`: cancel the session's in-flight turn.
pub async fn cancel_turn(
    State(state): State<Arc<HandlerState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = SessionId::from_raw(id);
    state.orchestrator.store().snapshot(&session_id)?;
    let cancelled = state.orchestrator.cancel(&session_id);
    Ok(Json(json!({ "session_id": session_id, "cancelled": cancelled })))
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<HandlerState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "active_turns": state.orchestrator.active_count(),
        "resident_sessions": state.orchestrator.store().resident_count(),
    }))
}
