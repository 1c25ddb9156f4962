//! Per-turn event stream.
//!
//! The turn task writes through an [`EventSink`], which stamps each event
//! with a gapless sequence starting at 0. The single consumer reads a
//! [`TurnStream`]. The queue is bounded; a producer that cannot make room
//! within the send timeout ends the stream with a `buffer_overrun` error that
//! takes the next sequence number. The turn itself keeps running, so
//! dropping the stream after an overrun does not cancel it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use folio_core::events::{StreamEvent, TurnEvent};
use folio_core::ids::SessionId;

use crate::error::EngineError;

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Events buffered between the turn and its consumer.
    pub capacity: usize,
    /// How long the turn waits for buffer room before declaring an overrun.
    pub send_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
struct Overrun {
    sequence: u64,
    session_id: Option<SessionId>,
}

impl Overrun {
    fn into_event(self) -> StreamEvent {
        let error = EngineError::BufferOverrun {
            sequence: self.sequence,
        };
        StreamEvent {
            sequence: self.sequence,
            event: TurnEvent::Error {
                error: error.to_string(),
                kind: error.error_kind().to_string(),
                session_id: self.session_id,
                edit_id: None,
            },
        }
    }
}

/// Create a connected sink/stream pair for one turn.
///
/// Dropping the stream cancels `cancel`, unless the stream ended on an
/// overrun.
pub fn channel(config: &StreamConfig, cancel: CancellationToken) -> (EventSink, TurnStream) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let overrun = Arc::new(Mutex::new(None));
    let sink = EventSink {
        tx: Some(tx),
        next: 0,
        send_timeout: config.send_timeout,
        session_id: None,
        overrun: Arc::clone(&overrun),
    };
    let stream = TurnStream {
        rx,
        overrun,
        cancel,
        done: false,
        overran: false,
    };
    (sink, stream)
}

/// Producer half. Owned by the turn task.
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
    next: u64,
    send_timeout: Duration,
    session_id: Option<SessionId>,
    overrun: Arc<Mutex<Option<Overrun>>>,
}

impl EventSink {
    /// Session named on the overrun error, once known.
    pub fn bind_session(&mut self, session_id: SessionId) {
        self.session_id = Some(session_id);
    }

    /// False once the consumer is gone or the buffer overran.
    pub fn is_attached(&self) -> bool {
        self.tx.is_some()
    }

    /// Stamp and deliver an event. Returns whether it reached the buffer.
    ///
    /// After the consumer detaches every send is a no-op.
    pub async fn send(&mut self, event: TurnEvent) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        let stamped = StreamEvent {
            sequence: self.next,
            event,
        };
        match tx.send_timeout(stamped, self.send_timeout).await {
            Ok(()) => {
                self.next += 1;
                true
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    session_id = ?self.session_id,
                    sequence = self.next,
                    "event buffer overrun; ending stream"
                );
                *self.overrun.lock() = Some(Overrun {
                    sequence: self.next,
                    session_id: self.session_id.clone(),
                });
                self.next += 1;
                self.tx = None;
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(session_id = ?self.session_id, "event consumer gone");
                self.tx = None;
                false
            }
        }
    }
}

/// Consumer half: a forward-only stream of sequenced events.
pub struct TurnStream {
    rx: mpsc::Receiver<StreamEvent>,
    overrun: Arc<Mutex<Option<Overrun>>>,
    cancel: CancellationToken,
    done: bool,
    overran: bool,
}

impl Stream for TurnStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.event.is_terminal() {
                    self.done = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.done = true;
                let overrun = self.overrun.lock().take();
                self.overran = overrun.is_some();
                Poll::Ready(overrun.map(Overrun::into_event))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if !self.overran {
            self.cancel.cancel();
        }
    }
}
