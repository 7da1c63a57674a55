//! Pipeline — a source, any number of transform stages and a terminal sink,
//! wired with `pipe_to` and watched as one unit.
//!
//! `run` resolves once the terminal sink finishes, or with the first error
//! seen anywhere in the chain. On failure every member is destroyed; output
//! the terminal sink already flushed stays where it is.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

use sluice_core::{Chunk, PipelineError, StreamError, StreamStatus};

use crate::sink::{wait_status, Sink};
use crate::source::{PipeOptions, Source};
use crate::transform::TransformStage;

type Destroyer = Box<dyn Fn() + Send + Sync + 'static>;

/// Destroys every member of a pipeline. Cheap to clone; usable from a
/// signal handler while `run` is pending elsewhere.
#[derive(Clone)]
pub struct Teardown {
    destroyers: Arc<Vec<Destroyer>>,
}

impl Teardown {
    pub fn destroy_all(&self) {
        for destroy in self.destroyers.iter() {
            destroy();
        }
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("members", &self.destroyers.len())
            .finish()
    }
}

struct Member {
    stage: String,
    status: watch::Receiver<StreamStatus>,
    terminal: bool,
}

/// A chain under construction, ending in a `Source<T>`.
pub struct Pipeline<T: Chunk> {
    tail: Source<T>,
    members: Vec<Member>,
    destroyers: Vec<Destroyer>,
}

impl<T: Chunk> Pipeline<T> {
    pub fn from_source(source: Source<T>) -> Self {
        let member = Member {
            stage: source.name().to_string(),
            status: source.watch_status(),
            terminal: false,
        };
        let handle = source.clone();
        Self {
            tail: source,
            members: vec![member],
            destroyers: vec![Box::new(move || handle.destroy(None))],
        }
    }

    /// Feed the chain into `stage` and continue from its read side.
    pub fn through<U: Chunk>(mut self, stage: TransformStage<T, U>) -> Pipeline<U> {
        self.tail.pipe_to(stage.writable(), PipeOptions::default());

        let name = stage.writable().name().to_string();
        self.members.push(Member {
            stage: name.clone(),
            status: stage.writable().watch_status(),
            terminal: false,
        });
        self.members.push(Member {
            stage: name,
            status: stage.readable().watch_status(),
            terminal: false,
        });

        let tail = stage.readable().clone();
        self.destroyers.push(Box::new(move || stage.destroy(None)));

        Pipeline {
            tail,
            members: self.members,
            destroyers: self.destroyers,
        }
    }

    /// Terminate the chain in `sink`.
    pub fn into_sink(mut self, sink: Sink<T>) -> ConnectedPipeline {
        self.tail.pipe_to(&sink, PipeOptions::default());

        self.members.push(Member {
            stage: sink.name().to_string(),
            status: sink.watch_status(),
            terminal: true,
        });
        self.destroyers.push(Box::new(move || sink.destroy(None)));

        ConnectedPipeline {
            members: self.members,
            teardown: Teardown {
                destroyers: Arc::new(self.destroyers),
            },
        }
    }
}

/// A fully wired chain, ready to be awaited.
pub struct ConnectedPipeline {
    members: Vec<Member>,
    teardown: Teardown,
}

impl ConnectedPipeline {
    pub fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    /// Wait for the terminal sink to finish or for the first failure.
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut waits: FuturesUnordered<_> = self
            .members
            .iter()
            .map(|member| {
                let terminal = member.terminal;
                let rx = member.status.clone();
                let stage = member.stage.clone();
                async move {
                    let status = wait_status(rx, move |s| {
                        s.error.is_some() || s.closed || (terminal && s.completed)
                    })
                    .await;
                    (stage, terminal, status)
                }
            })
            .collect();

        while let Some((stage, terminal, status)) = waits.next().await {
            if let Some(source) = status.error {
                return Err(self.fail(stage, source));
            }
            if status.completed {
                if terminal {
                    tracing::info!(
                        stage = %stage,
                        members = self.members.len(),
                        "pipeline finished"
                    );
                    return Ok(());
                }
                continue;
            }
            // Closed without completing: blame whoever recorded an error,
            // else this member.
            let (stage, source) = self
                .first_error()
                .unwrap_or((stage, StreamError::PrematureClose));
            return Err(self.fail(stage, source));
        }

        let stage = self
            .members
            .last()
            .map(|member| member.stage.clone())
            .unwrap_or_default();
        Err(self.fail(stage, StreamError::PrematureClose))
    }

    fn first_error(&self) -> Option<(String, StreamError)> {
        self.members.iter().find_map(|member| {
            let error = member.status.borrow().error.clone();
            error.map(|err| (member.stage.clone(), err))
        })
    }

    fn fail(&self, stage: String, source: StreamError) -> PipelineError {
        tracing::warn!(stage = %stage, error = %source, "pipeline failed, destroying members");
        self.teardown.destroy_all();
        PipelineError { stage, source }
    }
}

/// Wire `source` through `stages` into `sink`.
pub fn connect<T: Chunk>(
    source: Source<T>,
    stages: Vec<TransformStage<T, T>>,
    sink: Sink<T>,
) -> ConnectedPipeline {
    stages
        .into_iter()
        .fold(Pipeline::from_source(source), Pipeline::through)
        .into_sink(sink)
}
