//! sluice-core — chunk model, buffering, signals, errors and configuration.
//! The stream types in sluice-streams are built on this crate.

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod event;

pub use buffer::ChunkBuffer;
pub use chunk::{Chunk, Mode};
pub use config::{ConfigError, SluiceConfig, StreamConfig};
pub use error::{PipelineError, StreamError};
pub use event::{Event, Signals, StreamStatus};
