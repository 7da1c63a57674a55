//! DuplexChannel — one Sink and one Source behind a single handle.
//!
//! The two halves share no buffer state: ending the write side does not end
//! the read side and vice versa. They are tied together only at teardown.
//! With `linked_destroy` set, a side that closes without completing takes
//! the other side down with it.
//!
//! Each side publishes its own `Close` event to its own subscribers. The
//! channel as a whole has one close signal: `closed()`, which resolves once
//! both sides are down.

use std::sync::Weak;

use tokio::sync::watch;

use sluice_core::{Chunk, StreamError, StreamStatus};

use crate::sink::{wait_status, Sink, SinkShared};
use crate::source::{ConsumptionMode, ListenerId, PipeOptions, Source, SourceShared};

#[derive(Debug, Clone, Copy)]
pub struct DuplexOptions {
    pub linked_destroy: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            linked_destroy: true,
        }
    }
}

pub struct DuplexChannel<W: Chunk, R: Chunk> {
    sink: Sink<W>,
    source: Source<R>,
}

impl<W: Chunk, R: Chunk> Clone for DuplexChannel<W, R> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            source: self.source.clone(),
        }
    }
}

impl<W: Chunk, R: Chunk> std::fmt::Debug for DuplexChannel<W, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("sink", &self.sink)
            .field("source", &self.source)
            .finish()
    }
}

impl<W: Chunk, R: Chunk> DuplexChannel<W, R> {
    /// Pair two independently built halves. Must be called from within a
    /// tokio runtime when `linked_destroy` is set.
    pub fn new(sink: Sink<W>, source: Source<R>, options: DuplexOptions) -> Self {
        if options.linked_destroy {
            tokio::spawn(cascade(
                sink.watch_status(),
                std::sync::Arc::downgrade(source.shared()),
                |source: &SourceShared<R>| source.destroy(None),
            ));
            tokio::spawn(cascade(
                source.watch_status(),
                std::sync::Arc::downgrade(sink.shared()),
                |sink: &SinkShared<W>| sink.destroy(None),
            ));
        }
        Self { sink, source }
    }

    pub fn sink(&self) -> &Sink<W> {
        &self.sink
    }

    pub fn source(&self) -> &Source<R> {
        &self.source
    }

    pub fn into_parts(self) -> (Sink<W>, Source<R>) {
        (self.sink, self.source)
    }

    // ── Write side ────────────────────────────────────────────────────────

    pub fn write(&self, chunk: W) -> bool {
        self.sink.write(chunk)
    }

    pub fn write_with(
        &self,
        chunk: W,
        callback: impl FnOnce(Result<(), StreamError>) + Send + 'static,
    ) -> bool {
        self.sink.write_with(chunk, callback)
    }

    /// End the write side only.
    pub fn end(&self) {
        self.sink.end();
    }

    pub async fn finished(&self) -> Result<(), StreamError> {
        self.sink.finished().await
    }

    // ── Read side ─────────────────────────────────────────────────────────

    pub fn read(&self, size_hint: Option<usize>) -> Option<Vec<R>> {
        self.source.read(size_hint)
    }

    pub fn on_data(&self, listener: impl FnMut(&R) + Send + 'static) -> ListenerId {
        self.source.on_data(listener)
    }

    pub fn on_readable(&self, listener: impl FnMut() + Send + 'static) -> ListenerId {
        self.source.on_readable(listener)
    }

    pub fn set_consumption_mode(&self, mode: ConsumptionMode) {
        self.source.set_consumption_mode(mode);
    }

    pub fn pipe_to(&self, sink: &Sink<R>, options: PipeOptions) {
        self.source.pipe_to(sink, options);
    }

    pub async fn ended(&self) -> Result<(), StreamError> {
        self.source.ended().await
    }

    // ── Both sides ────────────────────────────────────────────────────────

    /// Destroy both halves. The error, if any, is reported once, on the
    /// write side.
    pub fn destroy(&self, error: Option<StreamError>) {
        self.sink.destroy(error);
        self.source.destroy(None);
    }

    /// The channel's close signal. Resolves once, after both halves have
    /// closed, with the final status of each (sink first).
    pub async fn closed(&self) -> (StreamStatus, StreamStatus) {
        tokio::join!(self.sink.closed(), self.source.closed())
    }
}

/// Destroy the peer when the watched side closes without completing.
async fn cascade<P>(
    watched: watch::Receiver<StreamStatus>,
    peer: Weak<P>,
    destroy: impl FnOnce(&P),
) {
    let status = wait_status(watched, |s| s.closed).await;
    if !status.closed || status.completed {
        return;
    }
    if let Some(peer) = peer.upgrade() {
        tracing::debug!(error = status.error.is_some(), "duplex side torn down, destroying peer");
        destroy(&peer);
    }
}
