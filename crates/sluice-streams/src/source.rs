//! Source — the readable side of a stream.
//!
//! Two tasks serve a source. The fetch task owns the transport and keeps the
//! buffer topped up to the high-water-mark, one `fetch` call at a time. The
//! delivery task moves buffered chunks to consumers:
//!
//! ```text
//!   Fetch::fetch ──▶ fetch task ──push──▶ [ buffer ] ──▶ delivery task
//!                                             │              │
//!                                          read()      on_data / pipe_to
//! ```
//!
//! Consumption mode is an explicit state machine. Listener attachment feeds
//! it: a readable listener forces `Paused` (pull with `read`), a data
//! listener or a pipe moves `Initial` to `Flowing` (push, one chunk per
//! delivery). A `Flowing` source with no data listener and no pipe discards
//! what it delivers; paused and initial sources never do.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch, Notify};

use sluice_core::{Chunk, ChunkBuffer, Event, Signals, StreamConfig, StreamError, StreamStatus};

use crate::sink::{settle, wait_status, Sink, SinkState};

/// Deliveries between cooperative yields of the delivery task.
const DELIVERY_BUDGET: usize = 32;

/// What one `fetch` call produced.
#[derive(Debug)]
pub enum Fetched<T> {
    /// Zero or more chunks. An empty batch is retried after a yield.
    Chunks(Vec<T>),
    End,
}

/// Transport capability consumed by a `Source`.
pub trait Fetch<T: Send + 'static>: Send + 'static {
    /// Produce more data. `size_hint` is the room left below the
    /// high-water-mark, in buffer units.
    fn fetch(&mut self, size_hint: usize) -> BoxFuture<'_, Result<Fetched<T>, StreamError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// No consumer attached yet.
    Initial,
    Paused,
    Flowing,
    Ended,
    Destroyed,
}

impl SourceState {
    fn is_terminal(self) -> bool {
        matches!(self, SourceState::Ended | SourceState::Destroyed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionMode {
    Paused,
    Flowing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// End the sink when the source ends.
    pub propagate_completion: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            propagate_completion: true,
        }
    }
}

type DataListener<T> = Box<dyn FnMut(&T) + Send + 'static>;
type ReadableListener = Box<dyn FnMut() + Send + 'static>;

struct PipeEdge<T: Chunk> {
    id: u64,
    sink: Sink<T>,
    propagate_completion: bool,
    /// Waiting on this sink's drain; guards against stacking drain waiters.
    awaiting_drain: bool,
    /// Never sent on. Dropping the edge closes it, which stops the tasks
    /// serving the edge and releases their sink handles.
    detached: watch::Sender<()>,
}

struct SourceInner<T: Chunk> {
    state: SourceState,
    buffer: ChunkBuffer<T>,
    /// The producer signalled end-of-data.
    eof: bool,
    /// A `read` saw the end; finish even though not flowing.
    end_requested: bool,
    /// `resume()` arrived before any per-chunk consumer.
    resume_requested: bool,
    /// Last readable listener removed; re-evaluate mode on the next turn.
    flow_scheduled: bool,
    paused_by_backpressure: bool,
    emitted_readable: bool,
    data_listeners: Vec<(ListenerId, DataListener<T>)>,
    data_count: usize,
    readable_listeners: Vec<(ListenerId, ReadableListener)>,
    readable_count: usize,
    /// Ids of the listeners taken out while being called. Removals of
    /// these that arrive meanwhile are applied when they are put back.
    taken: Vec<ListenerId>,
    pending_removals: Vec<ListenerId>,
    pipes: Vec<PipeEdge<T>>,
    next_id: u64,
    abandoned: bool,
}

impl<T: Chunk> SourceInner<T> {
    fn has_consumers(&self) -> bool {
        self.data_count > 0 || !self.pipes.is_empty() || self.readable_count > 0
    }

    fn has_push_consumers(&self) -> bool {
        self.data_count > 0 || !self.pipes.is_empty()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Change state and report the event to publish, if any.
    fn transition(&mut self, to: SourceState) -> Option<Event> {
        let from = self.state;
        if from == to || from.is_terminal() {
            return None;
        }
        self.state = to;
        match to {
            SourceState::Flowing => Some(Event::Resume),
            SourceState::Paused if from == SourceState::Flowing => Some(Event::Pause),
            _ => None,
        }
    }
}

pub(crate) struct SourceShared<T: Chunk> {
    config: StreamConfig,
    inner: Mutex<SourceInner<T>>,
    signals: Signals,
    /// Wakes the delivery task.
    wake: Notify,
    /// Wakes the fetch task.
    fetch_wake: Notify,
    /// Wakes producers waiting for room below the high-water-mark.
    demand: Notify,
}

enum Delivery<T: Chunk> {
    Chunk {
        chunk: T,
        listeners: Vec<(ListenerId, DataListener<T>)>,
        sinks: Vec<(u64, Sink<T>)>,
    },
    Readable(Vec<(ListenerId, ReadableListener)>),
    End(Vec<Sink<T>>),
    Wait,
    Exit,
}

enum Budget {
    Fetch(usize),
    Wait,
    Stop,
}

impl<T: Chunk> SourceShared<T> {
    fn lock(&self) -> MutexGuard<'_, SourceInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn publish(&self, event: Option<Event>) {
        if let Some(event) = event {
            tracing::debug!(stream = self.name(), ?event, "mode change");
            self.signals.emit(event);
        }
    }

    // ── Producer side ─────────────────────────────────────────────────────

    fn push(&self, chunk: T) -> bool {
        let mut inner = self.lock();
        if inner.state == SourceState::Destroyed {
            return false;
        }
        if inner.eof {
            drop(inner);
            tracing::debug!(stream = self.name(), "push after end of data");
            self.signals.emit(Event::Error(StreamError::PushAfterEnd));
            return false;
        }

        let units = inner.buffer.enqueue(chunk);
        inner.emitted_readable = false;
        let below = !inner.buffer.is_over_high_water_mark();
        let buffered = inner.buffer.size();
        drop(inner);

        tracing::trace!(stream = self.name(), units, buffered, "chunk buffered");
        self.wake.notify_one();
        below
    }

    fn push_eof(&self) {
        let mut inner = self.lock();
        if inner.eof || inner.state.is_terminal() {
            return;
        }
        inner.eof = true;
        inner.emitted_readable = false;
        drop(inner);

        tracing::debug!(stream = self.name(), "end of data");
        self.wake.notify_one();
    }

    fn budget(&self) -> Budget {
        let inner = self.lock();
        if inner.eof || inner.state.is_terminal() {
            return Budget::Stop;
        }
        if inner.abandoned && !inner.has_consumers() {
            return Budget::Stop;
        }
        // An empty buffer always fetches, even with a high-water-mark of 0.
        if inner.buffer.is_over_high_water_mark() && !inner.buffer.is_empty() {
            return Budget::Wait;
        }
        let room = inner
            .buffer
            .high_water_mark()
            .saturating_sub(inner.buffer.size());
        Budget::Fetch(room.max(1))
    }

    fn has_room(&self) -> bool {
        let inner = self.lock();
        inner.state.is_terminal()
            || inner.buffer.is_empty()
            || !inner.buffer.is_over_high_water_mark()
    }

    /// Buffer shrank: let the fetch task and blocked producers continue.
    fn relieve(&self) {
        self.fetch_wake.notify_one();
        self.demand.notify_waiters();
    }

    // ── Consumer side ─────────────────────────────────────────────────────

    fn read(&self, size_hint: Option<usize>) -> Option<Vec<T>> {
        let mut inner = self.lock();
        if inner.state == SourceState::Destroyed {
            return None;
        }

        let taken = if inner.buffer.is_empty() {
            None
        } else if inner.eof {
            Some(inner.buffer.dequeue_all())
        } else {
            match size_hint {
                None => Some(inner.buffer.dequeue_all()),
                Some(0) => None,
                Some(want) if inner.buffer.size() < want => None,
                Some(want) => Some(inner.buffer.take_units(want)),
            }
        };

        // A read that took nothing waits for the next push before another
        // readable announcement.
        if taken.is_some() {
            inner.emitted_readable = false;
        }
        if inner.eof && inner.buffer.is_empty() && !inner.state.is_terminal() {
            inner.end_requested = true;
        }
        drop(inner);

        self.relieve();
        self.wake.notify_one();
        taken
    }

    fn on_data(&self, listener: DataListener<T>) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_id());
        inner.data_listeners.push((id, listener));
        inner.data_count += 1;

        let event = match inner.state {
            SourceState::Initial => inner.transition(SourceState::Flowing),
            SourceState::Paused if inner.resume_requested && inner.readable_count == 0 => {
                inner.resume_requested = false;
                inner.transition(SourceState::Flowing)
            }
            _ => None,
        };
        drop(inner);

        self.publish(event);
        self.wake.notify_one();
        id
    }

    fn on_readable(&self, listener: ReadableListener) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_id());
        inner.readable_listeners.push((id, listener));
        inner.readable_count += 1;
        inner.emitted_readable = false;
        inner.paused_by_backpressure = false;
        let event = match inner.state {
            SourceState::Initial | SourceState::Flowing => inner.transition(SourceState::Paused),
            _ => None,
        };
        drop(inner);

        self.publish(event);
        self.wake.notify_one();
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();

        if let Some(pos) = inner.data_listeners.iter().position(|(l, _)| *l == id) {
            drop(inner.data_listeners.remove(pos));
            inner.data_count -= 1;
            return true;
        }
        if let Some(pos) = inner.readable_listeners.iter().position(|(l, _)| *l == id) {
            drop(inner.readable_listeners.remove(pos));
            inner.readable_count -= 1;
            if inner.readable_count == 0 {
                inner.flow_scheduled = true;
                drop(inner);
                self.wake.notify_one();
            }
            return true;
        }
        if inner.taken.contains(&id) && !inner.pending_removals.contains(&id) {
            inner.pending_removals.push(id);
            return true;
        }
        false
    }

    fn pause(&self) {
        let mut inner = self.lock();
        inner.resume_requested = false;
        inner.paused_by_backpressure = false;
        let event = match inner.state {
            SourceState::Initial | SourceState::Flowing => inner.transition(SourceState::Paused),
            _ => None,
        };
        drop(inner);
        self.publish(event);
    }

    fn resume(&self) {
        let mut inner = self.lock();
        if inner.state.is_terminal() || inner.state == SourceState::Flowing {
            return;
        }
        let event = if inner.has_push_consumers() && inner.readable_count == 0 {
            inner.resume_requested = false;
            inner.transition(SourceState::Flowing)
        } else {
            inner.resume_requested = true;
            None
        };
        drop(inner);

        self.publish(event);
        self.wake.notify_one();
    }

    fn attach(self: &Arc<Self>, sink: &Sink<T>, options: PipeOptions) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            drop(inner);
            if options.propagate_completion && self.signals.snapshot().completed {
                sink.end();
            }
            return;
        }

        let id = inner.next_id();
        let (detached, mut edge_gone) = watch::channel(());
        inner.pipes.push(PipeEdge {
            id,
            sink: sink.clone(),
            propagate_completion: options.propagate_completion,
            awaiting_drain: false,
            detached,
        });
        let event = match inner.state {
            SourceState::Initial | SourceState::Paused if inner.readable_count == 0 => {
                inner.transition(SourceState::Flowing)
            }
            _ => None,
        };
        drop(inner);

        tracing::debug!(stream = self.name(), sink = sink.name(), "piped");
        self.publish(event);
        self.wake.notify_one();

        // Detach once the sink closes; stop watching once the edge is gone.
        let shared = self.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sink.closed() => shared.detach(id),
                _ = edge_gone.changed() => {}
            }
        });
    }

    fn detach(&self, id: u64) {
        let mut inner = self.lock();
        let before = inner.pipes.len();
        inner.pipes.retain(|edge| edge.id != id);
        if inner.pipes.len() == before {
            return;
        }
        let event = if inner.pipes.is_empty() && inner.state == SourceState::Flowing {
            inner.paused_by_backpressure = false;
            inner.transition(SourceState::Paused)
        } else {
            None
        };
        drop(inner);

        tracing::debug!(stream = self.name(), "pipe target closed, detached");
        self.publish(event);
        self.wake.notify_one();
    }

    fn unpipe_all(&self) {
        let mut inner = self.lock();
        let edges = inner.pipes.len();
        inner.pipes.clear();
        inner.paused_by_backpressure = false;
        let event = match inner.state {
            SourceState::Initial | SourceState::Flowing => inner.transition(SourceState::Paused),
            _ => None,
        };
        drop(inner);

        tracing::debug!(stream = self.name(), edges, "unpiped");
        self.publish(event);
    }

    /// A saturated pipe target drained.
    fn edge_drained(&self, id: u64) {
        let mut inner = self.lock();

        let mut dead = false;
        if let Some(edge) = inner.pipes.iter_mut().find(|e| e.id == id) {
            edge.awaiting_drain = false;
            dead = matches!(edge.sink.state(), SinkState::Finished | SinkState::Destroyed);
        }
        if dead {
            inner.pipes.retain(|e| e.id != id);
        }

        let still_waiting = inner.pipes.iter().any(|e| e.awaiting_drain);
        let event = if !still_waiting
            && inner.paused_by_backpressure
            && inner.state == SourceState::Paused
        {
            inner.paused_by_backpressure = false;
            if inner.has_push_consumers() {
                inner.transition(SourceState::Flowing)
            } else {
                None
            }
        } else {
            None
        };
        drop(inner);

        self.publish(event);
        self.wake.notify_one();
    }

    pub(crate) fn destroy(&self, error: Option<StreamError>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = SourceState::Destroyed;
        let discarded = inner.buffer.len();
        inner.buffer.clear();
        inner.pipes.clear();
        drop(inner);

        tracing::debug!(
            stream = self.name(),
            discarded,
            error = error.as_ref().map(tracing::field::display),
            "source destroyed"
        );

        if let Some(err) = error {
            self.signals.mark_errored(err.clone());
            self.signals.emit(Event::Error(err));
        }
        self.signals.close();
        self.wake.notify_one();
        self.relieve();
    }

    fn abandon(&self) {
        self.lock().abandoned = true;
        self.wake.notify_one();
        self.fetch_wake.notify_one();
    }

    // ── Delivery task ─────────────────────────────────────────────────────

    fn next_delivery(&self) -> (Delivery<T>, Option<Event>) {
        let mut inner = self.lock();

        if inner.state.is_terminal() {
            return (Delivery::Exit, None);
        }

        let mut event = None;
        if std::mem::take(&mut inner.flow_scheduled) && inner.readable_count == 0 {
            if inner.has_push_consumers() {
                event = inner.transition(SourceState::Flowing);
            } else if inner.state == SourceState::Paused {
                inner.state = SourceState::Initial;
            }
        }

        if inner.state == SourceState::Flowing {
            if let Some(chunk) = inner.buffer.dequeue_one() {
                let listeners = std::mem::take(&mut inner.data_listeners);
                inner.taken = listeners.iter().map(|(id, _)| *id).collect();
                let sinks = inner
                    .pipes
                    .iter()
                    .map(|edge| (edge.id, edge.sink.clone()))
                    .collect();
                return (
                    Delivery::Chunk {
                        chunk,
                        listeners,
                        sinks,
                    },
                    event,
                );
            }
        }

        if inner.eof
            && inner.buffer.is_empty()
            && (inner.state == SourceState::Flowing || inner.end_requested)
        {
            inner.state = SourceState::Ended;
            let sinks = inner
                .pipes
                .drain(..)
                .filter(|edge| edge.propagate_completion)
                .map(|edge| edge.sink)
                .collect();
            return (Delivery::End(sinks), event);
        }

        if inner.state == SourceState::Paused
            && !inner.emitted_readable
            && (!inner.buffer.is_empty() || inner.eof)
        {
            inner.emitted_readable = true;
            let listeners = std::mem::take(&mut inner.readable_listeners);
            inner.taken = listeners.iter().map(|(id, _)| *id).collect();
            return (Delivery::Readable(listeners), event);
        }

        if inner.abandoned && !inner.has_consumers() {
            return (Delivery::Exit, event);
        }

        (Delivery::Wait, event)
    }

    fn deliver(
        self: &Arc<Self>,
        chunk: T,
        mut listeners: Vec<(ListenerId, DataListener<T>)>,
        sinks: Vec<(u64, Sink<T>)>,
    ) {
        self.relieve();

        if listeners.is_empty() && sinks.is_empty() {
            tracing::warn!(stream = self.name(), "flowing without consumers, chunk discarded");
        }
        for (_, listener) in listeners.iter_mut() {
            listener(&chunk);
        }

        let mut saturated = Vec::new();
        for (id, sink) in &sinks {
            if !sink.write(chunk.clone()) {
                saturated.push(*id);
            }
        }

        let mut inner = self.lock();
        inner.taken.clear();
        let added = std::mem::replace(&mut inner.data_listeners, listeners);
        inner.data_listeners.extend(added);
        if !inner.pending_removals.is_empty() {
            let removals = std::mem::take(&mut inner.pending_removals);
            let before = inner.data_listeners.len();
            inner
                .data_listeners
                .retain(|(id, _)| !removals.contains(id));
            let removed = before - inner.data_listeners.len();
            inner.data_count -= removed;
        }

        let mut waiters = Vec::new();
        for id in saturated {
            if let Some(edge) = inner.pipes.iter_mut().find(|e| e.id == id) {
                if !edge.awaiting_drain {
                    edge.awaiting_drain = true;
                    waiters.push((id, edge.sink.clone(), edge.detached.subscribe()));
                }
            }
        }
        let event = if inner.pipes.iter().any(|e| e.awaiting_drain)
            && inner.state == SourceState::Flowing
        {
            inner.paused_by_backpressure = true;
            inner.transition(SourceState::Paused)
        } else {
            None
        };
        drop(inner);

        self.publish(event);
        for (id, sink, mut edge_gone) in waiters {
            tracing::trace!(stream = self.name(), sink = sink.name(), "waiting for drain");
            let shared = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sink.drained() => shared.edge_drained(id),
                    _ = edge_gone.changed() => {}
                }
            });
        }
    }

    fn announce_readable(&self, mut listeners: Vec<(ListenerId, ReadableListener)>) {
        self.signals.emit(Event::Readable);
        for (_, listener) in listeners.iter_mut() {
            listener();
        }

        let mut inner = self.lock();
        inner.taken.clear();
        let added = std::mem::replace(&mut inner.readable_listeners, listeners);
        inner.readable_listeners.extend(added);
        if !inner.pending_removals.is_empty() {
            let removals = std::mem::take(&mut inner.pending_removals);
            let before = inner.readable_listeners.len();
            inner
                .readable_listeners
                .retain(|(id, _)| !removals.contains(id));
            let removed = before - inner.readable_listeners.len();
            inner.readable_count -= removed;
            if removed > 0 && inner.readable_count == 0 {
                inner.flow_scheduled = true;
            }
        }
    }

    fn finish(&self, sinks: Vec<Sink<T>>) {
        tracing::debug!(stream = self.name(), targets = sinks.len(), "source ended");
        self.signals.mark_completed();
        self.signals.emit(Event::End);
        for sink in sinks {
            sink.end();
        }
        self.signals.close();
        self.relieve();
    }
}

async fn run_delivery<T: Chunk>(shared: Arc<SourceShared<T>>) {
    let mut budget = DELIVERY_BUDGET;
    loop {
        let (step, event) = shared.next_delivery();
        shared.publish(event);

        match step {
            Delivery::Chunk {
                chunk,
                listeners,
                sinks,
            } => {
                shared.deliver(chunk, listeners, sinks);
                budget -= 1;
            }
            Delivery::Readable(listeners) => {
                shared.announce_readable(listeners);
                budget -= 1;
            }
            Delivery::End(sinks) => {
                shared.finish(sinks);
                break;
            }
            Delivery::Wait => shared.wake.notified().await,
            Delivery::Exit => break,
        }
        if budget == 0 {
            budget = DELIVERY_BUDGET;
            tokio::task::yield_now().await;
        }
    }
    tracing::trace!(stream = shared.name(), "delivery task exiting");
}

/// Owns the transport; the only place `Fetch::fetch` is called, so a fetch
/// always completes before the next one starts.
struct Fetcher<T: Chunk, F> {
    shared: Arc<SourceShared<T>>,
    transport: F,
}

impl<T: Chunk, F: Fetch<T>> Fetcher<T, F> {
    async fn run(mut self) {
        loop {
            let size_hint = match self.shared.budget() {
                Budget::Fetch(n) => n,
                Budget::Wait => {
                    self.shared.fetch_wake.notified().await;
                    continue;
                }
                Budget::Stop => break,
            };

            match self.transport.fetch(size_hint).await {
                Ok(Fetched::Chunks(chunks)) => {
                    if chunks.is_empty() {
                        tokio::task::yield_now().await;
                    }
                    for chunk in chunks {
                        self.shared.push(chunk);
                    }
                }
                Ok(Fetched::End) => {
                    self.shared.push_eof();
                    break;
                }
                Err(err) => {
                    tracing::warn!(stream = self.shared.name(), error = %err, "fetch failed");
                    self.shared.destroy(Some(err));
                    break;
                }
            }
        }
        tracing::trace!(stream = self.shared.name(), "fetch task exiting");
    }
}

struct SourceHandle<T: Chunk> {
    shared: Arc<SourceShared<T>>,
}

impl<T: Chunk> Drop for SourceHandle<T> {
    fn drop(&mut self) {
        self.shared.abandon();
    }
}

/// Readable stream handle. Clones share the same stream.
pub struct Source<T: Chunk> {
    handle: Arc<SourceHandle<T>>,
}

impl<T: Chunk> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<T: Chunk> std::fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("buffered", &self.buffered_size())
            .finish()
    }
}

impl<T: Chunk> Source<T> {
    /// Create a source over `transport`, spawning its fetch and delivery
    /// tasks. Fetching starts immediately and fills the buffer up to the
    /// high-water-mark even before a consumer attaches.
    /// Must be called from within a tokio runtime.
    pub fn new<F: Fetch<T>>(config: StreamConfig, transport: F) -> Self {
        let source = Self::pushable(config);
        tokio::spawn(
            Fetcher {
                shared: source.shared().clone(),
                transport,
            }
            .run(),
        );
        source
    }

    /// A source fed only through its `Pusher`.
    pub fn pushable(config: StreamConfig) -> Self {
        let inner = SourceInner {
            state: SourceState::Initial,
            buffer: ChunkBuffer::new(config.high_water_mark, config.mode),
            eof: false,
            end_requested: false,
            resume_requested: false,
            flow_scheduled: false,
            paused_by_backpressure: false,
            emitted_readable: false,
            data_listeners: Vec::new(),
            data_count: 0,
            readable_listeners: Vec::new(),
            readable_count: 0,
            taken: Vec::new(),
            pending_removals: Vec::new(),
            pipes: Vec::new(),
            next_id: 0,
            abandoned: false,
        };
        let shared = Arc::new(SourceShared {
            config,
            inner: Mutex::new(inner),
            signals: Signals::new(),
            wake: Notify::new(),
            fetch_wake: Notify::new(),
            demand: Notify::new(),
        });
        tokio::spawn(run_delivery(shared.clone()));

        Self {
            handle: Arc::new(SourceHandle { shared }),
        }
    }

    /// A source that yields the items of `iter`, then ends.
    pub fn from_iter<I>(config: StreamConfig, iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let mode = config.mode;
        Self::new(
            config,
            IterFetch {
                iter: iter.into_iter(),
                mode,
            },
        )
    }

    pub(crate) fn shared(&self) -> &Arc<SourceShared<T>> {
        &self.handle.shared
    }

    /// Producer handle for this source.
    pub fn pusher(&self) -> Pusher<T> {
        Pusher {
            shared: self.shared().clone(),
        }
    }

    /// Pull up to `size_hint` units, or everything when `None`.
    ///
    /// Returns `None` ("no data") when fewer units than requested are
    /// buffered and the producer has not ended. Once it has, returns
    /// whatever is left regardless of the hint.
    pub fn read(&self, size_hint: Option<usize>) -> Option<Vec<T>> {
        self.shared().read(size_hint)
    }

    /// Per-chunk listener. Moves an `Initial` source to `Flowing`.
    pub fn on_data(&self, listener: impl FnMut(&T) + Send + 'static) -> ListenerId {
        self.shared().on_data(Box::new(listener))
    }

    /// New-data-available listener. Moves the source to `Paused`; the
    /// listener is expected to call `read`.
    pub fn on_readable(&self, listener: impl FnMut() + Send + 'static) -> ListenerId {
        self.shared().on_readable(Box::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared().remove_listener(id)
    }

    pub fn set_consumption_mode(&self, mode: ConsumptionMode) {
        match mode {
            ConsumptionMode::Paused => self.pause(),
            ConsumptionMode::Flowing => self.resume(),
        }
    }

    pub fn pause(&self) {
        self.shared().pause();
    }

    /// Switch to `Flowing` if something consumes pushed chunks; otherwise
    /// remember the request for when a data listener attaches.
    pub fn resume(&self) {
        self.shared().resume();
    }

    /// Write every delivered chunk to `sink`, pausing while it is saturated.
    pub fn pipe_to(&self, sink: &Sink<T>, options: PipeOptions) {
        self.shared().attach(sink, options);
    }

    pub fn unpipe_all(&self) {
        self.shared().unpipe_all();
    }

    /// Tear the source down, discarding undelivered chunks.
    pub fn destroy(&self, error: Option<StreamError>) {
        self.shared().destroy(error);
    }

    pub fn state(&self) -> SourceState {
        self.shared().lock().state
    }

    pub fn buffered_size(&self) -> usize {
        self.shared().lock().buffer.size()
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared().config.high_water_mark
    }

    pub fn name(&self) -> &str {
        self.shared().name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared().signals.subscribe()
    }

    pub fn status(&self) -> StreamStatus {
        self.shared().signals.snapshot()
    }

    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.shared().signals.watch()
    }

    pub async fn closed(&self) -> StreamStatus {
        wait_status(self.watch_status(), |s| s.closed).await
    }

    /// Resolves with `Ok` on `end`, or the error that ended the source.
    pub async fn ended(&self) -> Result<(), StreamError> {
        let status = wait_status(self.watch_status(), |s| {
            s.completed || s.closed || s.error.is_some()
        })
        .await;
        settle(status)
    }
}

/// Producer-side handle: pushes chunks into a source's buffer.
pub struct Pusher<T: Chunk> {
    shared: Arc<SourceShared<T>>,
}

impl<T: Chunk> Clone for Pusher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Chunk> Pusher<T> {
    /// Buffer a chunk. `false` once the buffer is at the high-water-mark
    /// (or the source is gone); the producer should wait on `demand`.
    pub fn push(&self, chunk: T) -> bool {
        self.shared.push(chunk)
    }

    /// Signal end-of-data.
    pub fn end(&self) {
        self.shared.push_eof();
    }

    pub fn destroy(&self, error: Option<StreamError>) {
        self.shared.destroy(error);
    }

    /// Resolves once the buffer is below the high-water-mark or the source
    /// can no longer accept data.
    pub async fn demand(&self) {
        loop {
            let notified = self.shared.demand.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.has_room() {
                return;
            }
            notified.await;
        }
    }
}

/// Fetch transport over an iterator; each call fills the requested room.
struct IterFetch<I> {
    iter: I,
    mode: sluice_core::Mode,
}

impl<T, I> Fetch<T> for IterFetch<I>
where
    T: Chunk,
    I: Iterator<Item = T> + Send + 'static,
{
    fn fetch(&mut self, size_hint: usize) -> BoxFuture<'_, Result<Fetched<T>, StreamError>> {
        let mut chunks = Vec::new();
        let mut units = 0;
        while units < size_hint.max(1) {
            match self.iter.next() {
                Some(chunk) => {
                    units += self.mode.measure(&chunk);
                    chunks.push(chunk);
                }
                None => break,
            }
        }
        let fetched = if chunks.is_empty() {
            Fetched::End
        } else {
            Fetched::Chunks(chunks)
        };
        Box::pin(async move { Ok(fetched) })
    }
}
