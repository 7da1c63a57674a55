//! Error taxonomy shared by every stream type.
//!
//! Transport errors are fatal to the stream that saw them. Usage errors
//! (writing after end, writing after destroy) go back to the offending call
//! and leave accepted work alone. Pipeline errors name the stage that failed.

use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("transport failed: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("write after end")]
    WriteAfterEnd,
    #[error("push after end of data")]
    PushAfterEnd,
    #[error("stream destroyed")]
    Destroyed,
    #[error("premature close")]
    PrematureClose,
}

impl StreamError {
    /// Wrap any transport-level failure.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(Arc::from(err.into()))
    }

    /// True for API sequencing mistakes, as opposed to transport failures.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::WriteAfterEnd | Self::PushAfterEnd | Self::Destroyed
        )
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// First failure seen anywhere in a pipeline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("pipeline stage `{stage}` failed: {source}")]
pub struct PipelineError {
    pub stage: String,
    pub source: StreamError,
}
