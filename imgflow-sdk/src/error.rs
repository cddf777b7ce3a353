use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to callers of the runner commands.
///
/// Per-image and batch-step failures are not errors here: they end up as
/// `StepOutcome::Failed` values folded into the execution record.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The workflow or source was rejected before anything was recorded
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    /// The source could not begin enumeration; the execution is recorded as failed
    #[error("execution {execution_id}: source '{source_type}' failed to open: {source}")]
    Source {
        execution_id: Uuid,
        source_type: String,
        #[source]
        source: SourceError,
    },

    #[error("runner is busy with execution {0}")]
    RunnerBusy(Uuid),

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("recorder error: {0}")]
    Recorder(String),
}

impl EngineError {
    pub fn config(problem: impl Into<String>) -> Self {
        EngineError::Config(vec![problem.into()])
    }
}

/// Reasons a source fails to open (or to fetch a single item).
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("cannot read {}: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("invalid source parameters: {0}")]
    InvalidParameters(String),

    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from editing or (de)serializing a workflow definition.
#[derive(Error, Debug)]
pub enum WorkflowEditError {
    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("reorder does not match current steps (missing: {missing:?}, unknown: {unknown:?})")]
    ReorderMismatch {
        missing: Vec<String>,
        unknown: Vec<String>,
    },

    #[error("invalid workflow: {}", .0.join("; "))]
    InvalidWorkflow(Vec<String>),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WorkflowEditError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowEditError::Serialization(err.to_string())
    }
}
