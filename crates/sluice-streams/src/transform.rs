//! TransformStage — a duplex channel whose read side is derived from its
//! write side.
//!
//! Each written chunk is handed to `Transform::transform` exactly once, in
//! order, by the write side's dispatch task. Output goes through a `Pusher`
//! onto the read side. After the write side ends and the last transform
//! has completed, `flush` runs once and the read side is ended.

use futures::future::BoxFuture;

use sluice_core::{Chunk, StreamConfig, StreamError};

use crate::duplex::{DuplexChannel, DuplexOptions};
use crate::sink::{Emit, Sink};
use crate::source::{Pusher, Source};

/// Mapping capability of a `TransformStage`.
pub trait Transform<I, O: Chunk>: Send + 'static {
    /// Turn one input chunk into zero or more outputs pushed onto `out`.
    /// The returned future completing is the per-chunk completion signal.
    fn transform(&mut self, chunk: I, out: Pusher<O>) -> BoxFuture<'_, Result<(), StreamError>>;

    /// Emit trailing output once the input has ended.
    fn flush(&mut self, out: Pusher<O>) -> BoxFuture<'_, Result<(), StreamError>> {
        let _ = out;
        Box::pin(async { Ok(()) })
    }
}

/// Buffer configuration of both sides of a stage.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub writable: StreamConfig,
    pub readable: StreamConfig,
}

impl TransformConfig {
    /// Same configuration on both sides; the read side is named `<name>.out`.
    pub fn symmetric(config: StreamConfig) -> Self {
        let readable = config.clone().with_name(format!("{}.out", config.name));
        Self {
            writable: config,
            readable,
        }
    }
}

/// Drives a `Transform` from the write side's dispatch task.
struct Stage<X, O: Chunk> {
    transform: X,
    out: Pusher<O>,
}

impl<I, O, X> Emit<I> for Stage<X, O>
where
    I: Chunk,
    O: Chunk,
    X: Transform<I, O>,
{
    fn emit(&mut self, chunk: I) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            self.transform.transform(chunk, self.out.clone()).await?;
            // Hold the next input while the read side is saturated.
            self.out.demand().await;
            Ok(())
        })
    }

    fn finalize(&mut self) -> BoxFuture<'_, Result<(), StreamError>> {
        Box::pin(async move {
            self.transform.flush(self.out.clone()).await?;
            self.out.end();
            Ok(())
        })
    }
}

pub struct TransformStage<I: Chunk, O: Chunk> {
    channel: DuplexChannel<I, O>,
}

impl<I: Chunk, O: Chunk> Clone for TransformStage<I, O> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<I: Chunk, O: Chunk> std::fmt::Debug for TransformStage<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransformStage").field(&self.channel).finish()
    }
}

impl<I: Chunk, O: Chunk> TransformStage<I, O> {
    pub fn new<X: Transform<I, O>>(config: TransformConfig, transform: X) -> Self {
        let source = Source::pushable(config.readable);
        let stage = Stage {
            transform,
            out: source.pusher(),
        };
        let sink = Sink::new(config.writable, stage);
        Self {
            channel: DuplexChannel::new(sink, source, DuplexOptions::default()),
        }
    }

    /// Stage over a per-chunk closure with no trailing output.
    pub fn from_fn<F>(config: TransformConfig, map: F) -> Self
    where
        F: FnMut(I, &Pusher<O>) -> Result<(), StreamError> + Send + 'static,
    {
        let flush = |_: &Pusher<O>| -> Result<(), StreamError> { Ok(()) };
        Self::new(config, FnTransform::new(map, flush))
    }

    /// Stage over a per-chunk closure plus a flush closure.
    pub fn from_fns<F, G>(config: TransformConfig, map: F, flush: G) -> Self
    where
        F: FnMut(I, &Pusher<O>) -> Result<(), StreamError> + Send + 'static,
        G: FnMut(&Pusher<O>) -> Result<(), StreamError> + Send + 'static,
    {
        Self::new(config, FnTransform::new(map, flush))
    }

    /// Input side, as seen by the upstream.
    pub fn writable(&self) -> &Sink<I> {
        self.channel.sink()
    }

    /// Output side, as seen by the downstream.
    pub fn readable(&self) -> &Source<O> {
        self.channel.source()
    }

    pub fn channel(&self) -> &DuplexChannel<I, O> {
        &self.channel
    }

    pub fn destroy(&self, error: Option<StreamError>) {
        self.channel.destroy(error);
    }
}

/// Synchronous transform built from closures.
pub struct FnTransform<F, G> {
    map: F,
    flush: G,
}

impl<F, G> FnTransform<F, G> {
    pub fn new(map: F, flush: G) -> Self {
        Self { map, flush }
    }
}

impl<I, O, F, G> Transform<I, O> for FnTransform<F, G>
where
    I: Send + 'static,
    O: Chunk,
    F: FnMut(I, &Pusher<O>) -> Result<(), StreamError> + Send + 'static,
    G: FnMut(&Pusher<O>) -> Result<(), StreamError> + Send + 'static,
{
    fn transform(&mut self, chunk: I, out: Pusher<O>) -> BoxFuture<'_, Result<(), StreamError>> {
        let result = (self.map)(chunk, &out);
        Box::pin(async move { result })
    }

    fn flush(&mut self, out: Pusher<O>) -> BoxFuture<'_, Result<(), StreamError>> {
        let result = (self.flush)(&out);
        Box::pin(async move { result })
    }
}
