//! Execution sandbox: one disposable worker process per program.
//!
//! The [`Sandbox`] supervisor spawns the worker, feeds it the source, reads its
//! frames, and kills it when the deadline passes. Everything it learns comes
//! back as an [`Execution`]; the worker's process and scratch directory stay
//! alive in the [`SandboxHandle`] until the reaper releases them.

mod frames;
mod handle;
mod limits;
mod logs;
mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

use capsules_js_exec::{Report, ValueGraph};
use thiserror::Error;
use uuid::Uuid;

pub use frames::FrameReader;
pub use handle::{CleanupError, SandboxHandle};
pub use limits::ResourceLimits;
pub use logs::LogBuffer;
pub use supervisor::Sandbox;

/// How one execution ended. Produced exactly once per execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(CapturedValue),
    Failed(String),
}

/// The completion value as the worker reported it.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedValue {
    Graph(ValueGraph),
    /// The program finished but its value could not be captured.
    Uncapturable { reason: String },
}

impl From<Report> for ExecutionOutcome {
    fn from(report: Report) -> Self {
        match report {
            Report::Completed { value } => ExecutionOutcome::Completed(CapturedValue::Graph(value)),
            Report::Unserializable { message } => {
                ExecutionOutcome::Completed(CapturedValue::Uncapturable { reason: message })
            }
            Report::Failed { message } => ExecutionOutcome::Failed(message),
        }
    }
}

impl ExecutionOutcome {
    /// Short label for structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed(_) => "completed",
            ExecutionOutcome::Failed(_) => "failed",
        }
    }
}

/// Everything one run produced.
#[derive(Debug)]
pub struct Execution {
    pub id: Uuid,
    pub outcome: ExecutionOutcome,
    pub logs: Vec<String>,
    pub handle: SandboxHandle,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create scratch directory: {0}")]
    Workdir(#[source] std::io::Error),

    #[error("failed to spawn worker {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} was spawned without piped stdio")]
    MissingPipe(&'static str),

    #[error("sandbox is shutting down")]
    Closed,
}
