//! Sink — the writable side of a stream.
//!
//! Producers call `write`, which queues the chunk and returns immediately.
//! A dispatch task owns the transport and hands chunks to `Emit::emit` one
//! at a time, so completions always happen in submission order. `write`
//! reports backpressure through its return value; `drain` tells a stalled
//! producer when the queue has fully flushed.
//!
//! ```text
//!   write ──▶ [ pending writes ] ──▶ dispatch task ──▶ Emit::emit
//!                                          │
//!                                   callbacks, drain, finish
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch, Notify};

use sluice_core::{Chunk, ChunkBuffer, Event, Signals, StreamConfig, StreamError, StreamStatus};

/// Completion callback for a single write.
pub type WriteCallback = Box<dyn FnOnce(Result<(), StreamError>) + Send + 'static>;

/// Transport capability consumed by a `Sink`.
///
/// Only `emit` is required. Transports that can write several chunks in one
/// operation report `batching() == true` and override `emit_batch`.
pub trait Emit<T: Send + 'static>: Send + 'static {
    fn emit(&mut self, chunk: T) -> BoxFuture<'_, Result<(), StreamError>>;

    fn batching(&self) -> bool {
        false
    }

    fn emit_batch(&mut self, chunks: Vec<T>) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            for chunk in chunks {
                self.emit(chunk).await?;
            }
            Ok(())
        })
    }

    /// Runs once after the last write completed and before `finish`.
    fn finalize(&mut self) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Writable,
    Ending,
    Finished,
    Destroyed,
}

impl SinkState {
    fn is_terminal(self) -> bool {
        matches!(self, SinkState::Finished | SinkState::Destroyed)
    }
}

struct PendingWrite {
    callback: Option<WriteCallback>,
    batched: bool,
}

struct SinkInner<T> {
    state: SinkState,
    /// Chunks not yet handed to the transport.
    queue: ChunkBuffer<T>,
    /// Parallel to `queue`, one entry per chunk.
    pending: VecDeque<PendingWrite>,
    in_flight: bool,
    in_flight_units: usize,
    finalizing: bool,
    batch_depth: usize,
    need_drain: bool,
    /// Destroyed while the transport was busy; close once it settles.
    close_pending: bool,
    abandoned: bool,
}

impl<T: Chunk> SinkInner<T> {
    /// Units accepted but not yet completed, in-flight included.
    fn buffered(&self) -> usize {
        self.queue.size() + self.in_flight_units
    }

    fn busy(&self) -> bool {
        self.in_flight || self.finalizing
    }

    fn discard_queued(&mut self) -> usize {
        let discarded = self.pending.len();
        self.queue.clear();
        self.pending.clear();
        discarded
    }
}

pub(crate) struct SinkShared<T> {
    config: StreamConfig,
    inner: Mutex<SinkInner<T>>,
    signals: Signals,
    /// Wakes the dispatch task.
    wake: Notify,
    /// Wakes `drained()` waiters.
    drain: Notify,
}

/// One batch of work handed to the transport.
struct Dispatch<T> {
    chunks: Vec<T>,
    callbacks: Vec<Option<WriteCallback>>,
    units: usize,
}

enum Step<T> {
    Dispatch(Dispatch<T>),
    Finalize,
    Wait,
    Exit,
}

impl<T: Chunk> SinkShared<T> {
    fn lock(&self) -> MutexGuard<'_, SinkInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// Deliver a usage error to exactly one observer.
    fn report(&self, callback: Option<WriteCallback>, err: StreamError) {
        match callback {
            Some(cb) => cb(Err(err)),
            None => self.signals.emit(Event::Error(err)),
        }
    }

    fn submit(&self, chunk: T, callback: Option<WriteCallback>) -> bool {
        let mut inner = self.lock();

        let rejection = match inner.state {
            SinkState::Writable => None,
            SinkState::Ending | SinkState::Finished => Some(StreamError::WriteAfterEnd),
            SinkState::Destroyed => Some(StreamError::Destroyed),
        };
        if let Some(err) = rejection {
            drop(inner);
            tracing::debug!(stream = self.name(), error = %err, "write rejected");
            self.report(callback, err);
            return false;
        }

        let units = inner.queue.enqueue(chunk);
        let batched = inner.batch_depth > 0;
        inner.pending.push_back(PendingWrite { callback, batched });

        let buffered = inner.buffered();
        let below = buffered < self.config.high_water_mark;
        if !below {
            inner.need_drain = true;
        }
        drop(inner);

        tracing::trace!(stream = self.name(), units, buffered, batched, "write queued");
        self.wake.notify_one();
        below
    }

    fn end(&self) {
        let mut inner = self.lock();
        if inner.state != SinkState::Writable {
            return;
        }
        inner.state = SinkState::Ending;
        // end() flushes any open batch.
        inner.batch_depth = 0;
        drop(inner);

        tracing::debug!(stream = self.name(), "sink ending");
        self.wake.notify_one();
        self.drain.notify_waiters();
    }

    pub(crate) fn destroy(&self, error: Option<StreamError>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = SinkState::Destroyed;
        let discarded = inner.discard_queued();
        let settle_now = !inner.busy();
        if !settle_now {
            inner.close_pending = true;
        }
        drop(inner);

        tracing::debug!(
            stream = self.name(),
            discarded,
            settle_now,
            error = error.as_ref().map(tracing::field::display),
            "sink destroyed"
        );

        if let Some(err) = error {
            self.signals.mark_errored(err.clone());
            self.signals.emit(Event::Error(err));
        }
        if settle_now {
            self.signals.close();
        }
        self.wake.notify_one();
        self.drain.notify_waiters();
    }

    fn begin_batch(&self) {
        let mut inner = self.lock();
        if inner.state == SinkState::Writable {
            inner.batch_depth += 1;
        }
    }

    fn end_batch(&self) {
        let mut inner = self.lock();
        if inner.batch_depth == 0 {
            return;
        }
        inner.batch_depth -= 1;
        let released = inner.batch_depth == 0;
        drop(inner);

        if released {
            self.wake.notify_one();
        }
    }

    fn abandon(&self) {
        self.lock().abandoned = true;
        self.wake.notify_one();
    }

    fn next_step(&self, batching: bool) -> Step<T> {
        let mut inner = self.lock();

        if inner.state.is_terminal() {
            return Step::Exit;
        }

        if inner.batch_depth == 0 && !inner.queue.is_empty() {
            let mode = inner.queue.mode();
            let front_batched = inner.pending.front().is_some_and(|p| p.batched);
            let take = if front_batched && batching {
                inner.pending.iter().take_while(|p| p.batched).count()
            } else {
                1
            };

            let mut dispatch = Dispatch {
                chunks: Vec::with_capacity(take),
                callbacks: Vec::with_capacity(take),
                units: 0,
            };
            for _ in 0..take {
                let chunk = inner.queue.dequeue_one();
                let write = inner.pending.pop_front();
                let (Some(chunk), Some(write)) = (chunk, write) else {
                    break;
                };
                dispatch.units += mode.measure(&chunk);
                dispatch.chunks.push(chunk);
                dispatch.callbacks.push(write.callback);
            }

            inner.in_flight = true;
            inner.in_flight_units = dispatch.units;
            return Step::Dispatch(dispatch);
        }

        if inner.state == SinkState::Ending && inner.queue.is_empty() {
            inner.finalizing = true;
            return Step::Finalize;
        }

        if inner.abandoned && inner.queue.is_empty() {
            return Step::Exit;
        }

        Step::Wait
    }

    fn complete(
        &self,
        units: usize,
        callbacks: Vec<Option<WriteCallback>>,
        result: Result<(), StreamError>,
    ) {
        let mut inner = self.lock();
        inner.in_flight = false;
        inner.in_flight_units = 0;

        match result {
            Ok(()) => {
                let drained = inner.need_drain
                    && inner.buffered() == 0
                    && inner.state == SinkState::Writable;
                if drained {
                    inner.need_drain = false;
                }
                let close_now = std::mem::take(&mut inner.close_pending);
                drop(inner);

                tracing::trace!(stream = self.name(), units, "write completed");
                for callback in callbacks.into_iter().flatten() {
                    callback(Ok(()));
                }
                if drained {
                    tracing::trace!(stream = self.name(), "drain");
                    self.signals.emit(Event::Drain);
                    self.drain.notify_waiters();
                }
                if close_now {
                    self.signals.close();
                }
            }
            Err(err) => {
                let already_destroyed = inner.state == SinkState::Destroyed;
                inner.state = SinkState::Destroyed;
                let discarded = inner.discard_queued();
                inner.close_pending = false;
                drop(inner);

                tracing::warn!(stream = self.name(), error = %err, discarded, "emit failed");

                let mut observed = false;
                for callback in callbacks.into_iter().flatten() {
                    callback(Err(err.clone()));
                    observed = true;
                }
                if !already_destroyed {
                    self.signals.mark_errored(err.clone());
                    if !observed {
                        self.signals.emit(Event::Error(err));
                    }
                }
                self.signals.close();
                self.drain.notify_waiters();
            }
        }
    }

    fn finalized(&self, result: Result<(), StreamError>) {
        let mut inner = self.lock();
        inner.finalizing = false;

        if inner.state == SinkState::Destroyed {
            let close_now = std::mem::take(&mut inner.close_pending);
            drop(inner);
            if close_now {
                self.signals.close();
            }
            return;
        }

        match result {
            Ok(()) => {
                inner.state = SinkState::Finished;
                drop(inner);

                tracing::debug!(stream = self.name(), "sink finished");
                self.signals.mark_completed();
                self.signals.emit(Event::Finish);
                self.signals.close();
            }
            Err(err) => {
                inner.state = SinkState::Destroyed;
                drop(inner);

                tracing::warn!(stream = self.name(), error = %err, "finalize failed");
                self.signals.mark_errored(err.clone());
                self.signals.emit(Event::Error(err));
                self.signals.close();
            }
        }
        self.drain.notify_waiters();
    }

    fn owes_drain(&self) -> bool {
        let inner = self.lock();
        inner.need_drain && inner.state == SinkState::Writable
    }
}

/// Owns the transport; the only place `Emit` methods are called.
struct Dispatcher<T, E> {
    shared: Arc<SinkShared<T>>,
    transport: E,
}

impl<T: Chunk, E: Emit<T>> Dispatcher<T, E> {
    async fn run(mut self) {
        loop {
            match self.shared.next_step(self.transport.batching()) {
                Step::Dispatch(dispatch) => self.dispatch(dispatch).await,
                Step::Finalize => {
                    let result = self.transport.finalize().await;
                    self.shared.finalized(result);
                }
                Step::Wait => self.shared.wake.notified().await,
                Step::Exit => break,
            }
        }
        tracing::trace!(stream = self.shared.name(), "dispatch task exiting");
    }

    async fn dispatch(&mut self, dispatch: Dispatch<T>) {
        let Dispatch {
            mut chunks,
            callbacks,
            units,
        } = dispatch;

        let result = if chunks.len() == 1 {
            match chunks.pop() {
                Some(chunk) => self.transport.emit(chunk).await,
                None => Ok(()),
            }
        } else {
            tracing::trace!(stream = self.shared.name(), count = chunks.len(), "batched emit");
            self.transport.emit_batch(chunks).await
        };

        self.shared.complete(units, callbacks, result);
    }
}

struct SinkHandle<T: Chunk> {
    shared: Arc<SinkShared<T>>,
}

impl<T: Chunk> Drop for SinkHandle<T> {
    fn drop(&mut self) {
        self.shared.abandon();
    }
}

/// Writable stream handle. Clones share the same stream.
pub struct Sink<T: Chunk> {
    handle: Arc<SinkHandle<T>>,
}

impl<T: Chunk> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<T: Chunk> std::fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("buffered", &self.buffered_size())
            .finish()
    }
}

impl<T: Chunk> Sink<T> {
    /// Create a sink over `transport` and spawn its dispatch task.
    /// Must be called from within a tokio runtime.
    pub fn new<E: Emit<T>>(config: StreamConfig, transport: E) -> Self {
        let inner = SinkInner {
            state: SinkState::Writable,
            queue: ChunkBuffer::new(config.high_water_mark, config.mode),
            pending: VecDeque::new(),
            in_flight: false,
            in_flight_units: 0,
            finalizing: false,
            batch_depth: 0,
            need_drain: false,
            close_pending: false,
            abandoned: false,
        };
        let shared = Arc::new(SinkShared {
            config,
            inner: Mutex::new(inner),
            signals: Signals::new(),
            wake: Notify::new(),
            drain: Notify::new(),
        });

        tokio::spawn(
            Dispatcher {
                shared: shared.clone(),
                transport,
            }
            .run(),
        );

        Self {
            handle: Arc::new(SinkHandle { shared }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SinkShared<T>> {
        &self.handle.shared
    }

    /// Queue a chunk. `false` means the buffer reached the high-water-mark
    /// and the producer should wait for `drained()`.
    pub fn write(&self, chunk: T) -> bool {
        self.shared().submit(chunk, None)
    }

    /// Like `write`, with a callback fired once the transport has taken the
    /// chunk (or the write failed). Callbacks fire in submission order.
    pub fn write_with(
        &self,
        chunk: T,
        callback: impl FnOnce(Result<(), StreamError>) + Send + 'static,
    ) -> bool {
        self.shared().submit(chunk, Some(Box::new(callback)))
    }

    /// Stop accepting writes; finish once everything queued has completed.
    pub fn end(&self) {
        self.shared().end();
    }

    pub fn end_with(&self, chunk: T) {
        self.write(chunk);
        self.end();
    }

    /// Tear the sink down. Queued writes are dropped without their
    /// callbacks; an in-flight write is left to settle, then `close` fires.
    pub fn destroy(&self, error: Option<StreamError>) {
        self.shared().destroy(error);
    }

    /// Hold dispatch until the matching `end_batch`. Batches nest.
    pub fn begin_batch(&self) {
        self.shared().begin_batch();
    }

    pub fn end_batch(&self) {
        self.shared().end_batch();
    }

    pub fn state(&self) -> SinkState {
        self.shared().lock().state
    }

    pub fn buffered_size(&self) -> usize {
        self.shared().lock().buffered()
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

    /// Resolves once no drain is owed: the buffer flushed after a `false`
    /// write, or the sink stopped accepting writes.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared().drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.shared().owes_drain() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves when `close` has been signalled.
    pub async fn closed(&self) -> StreamStatus {
        wait_status(self.watch_status(), |s| s.closed).await
    }

    /// Resolves with `Ok` on `finish`, or the error that ended the sink.
    pub async fn finished(&self) -> Result<(), StreamError> {
        let status = wait_status(self.watch_status(), |s| {
            s.completed || s.closed || s.error.is_some()
        })
        .await;
        settle(status)
    }
}

pub(crate) async fn wait_status(
    mut rx: watch::Receiver<StreamStatus>,
    ready: impl FnMut(&StreamStatus) -> bool,
) -> StreamStatus {
    let settled = match rx.wait_for(ready).await {
        Ok(status) => Some(StreamStatus::clone(&status)),
        Err(_) => None,
    };
    settled.unwrap_or_else(|| StreamStatus::clone(&rx.borrow()))
}

pub(crate) fn settle(status: StreamStatus) -> Result<(), StreamError> {
    match status.error {
        Some(err) => Err(err),
        None if status.completed => Ok(()),
        None => Err(StreamError::PrematureClose),
    }
}
