//! Observable signals.
//!
//! Every stream owns a `Signals`: a broadcast channel of discrete events
//! (readable, drain, end, ...) and a watch channel holding the lifecycle
//! status. The watch never lags, so completion and error can always be
//! observed even by a subscriber that missed the event itself.

use tokio::sync::{broadcast, watch};

use crate::error::StreamError;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    /// Paused-mode data is waiting for `read`.
    Readable,
    /// A saturated sink has flushed its buffer.
    Drain,
    /// A source delivered its last chunk.
    End,
    /// A sink flushed every write and ran its finalize hook.
    Finish,
    Error(StreamError),
    Close,
    Pause,
    Resume,
}

/// Lifecycle snapshot. `completed` means end (source) or finish (sink).
#[derive(Debug, Clone, Default)]
pub struct StreamStatus {
    pub completed: bool,
    pub error: Option<StreamError>,
    pub closed: bool,
}

impl StreamStatus {
    /// Closed without completing and without an error of its own.
    pub fn is_premature_close(&self) -> bool {
        self.closed && !self.completed && self.error.is_none()
    }
}

#[derive(Debug)]
pub struct Signals {
    events: broadcast::Sender<Event>,
    status: watch::Sender<StreamStatus>,
}

impl Signals {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(StreamStatus::default());
        Self { events, status }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<StreamStatus> {
        self.status.subscribe()
    }

    pub fn snapshot(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn mark_completed(&self) {
        self.status.send_modify(|s| s.completed = true);
    }

    /// Record the terminal error. Only the first one sticks.
    pub fn mark_errored(&self, err: StreamError) {
        self.status.send_modify(|s| {
            if s.error.is_none() {
                s.error = Some(err);
            }
        });
    }

    /// Mark closed and publish `Close`. Idempotent.
    pub fn close(&self) {
        let mut first = false;
        self.status.send_modify(|s| {
            first = !s.closed;
            s.closed = true;
        });
        if first {
            self.emit(Event::Close);
        }
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}
