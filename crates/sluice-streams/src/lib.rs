//! sluice-streams — sinks, sources, duplex channels, transform stages and
//! pipelines over the sluice-core buffer model.
//!
//! Every stream type is a cheap `Clone` handle; the work behind it runs on
//! tokio tasks spawned at construction, so constructors must be called from
//! within a runtime.

pub mod duplex;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod transform;

pub use duplex::{DuplexChannel, DuplexOptions};
pub use pipeline::{connect, ConnectedPipeline, Pipeline, Teardown};
pub use sink::{Emit, Sink, SinkState, WriteCallback};
pub use source::{
    ConsumptionMode, Fetch, Fetched, ListenerId, PipeOptions, Pusher, Source, SourceState,
};
pub use transform::{FnTransform, Transform, TransformConfig, TransformStage};
