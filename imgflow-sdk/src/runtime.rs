use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::ProgressEvent;
use crate::model::{SourceConfig, Workflow};
use crate::record::ExecutionRecord;
use crate::schema::ActionSchema;
use crate::source::SourceDescriptor;

/// Result of a cancellation request against a specific execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Accepted,
    AlreadyTerminal,
    NotFound,
}

/// Runtime trait for running workflows.
/// This is the surface the CLI (or any other front end) talks to.
#[async_trait]
pub trait WorkflowRuntime: Send + Sync {
    /// All registered step actions with their parameter schemas
    fn list_actions(&self) -> Vec<ActionSchema>;

    /// All registered source providers
    fn list_sources(&self) -> Vec<SourceDescriptor>;

    /// Check a workflow and source without starting anything
    fn validate(&self, workflow: &Workflow, source: &SourceConfig) -> Result<(), EngineError>;

    /// Start an execution in the background. `output_dir` of `None` uses the configured default.
    async fn start(
        &self,
        workflow: Workflow,
        source: SourceConfig,
        output_dir: Option<PathBuf>,
    ) -> Result<Uuid, EngineError>;

    async fn cancel(&self, execution_id: &Uuid) -> CancelOutcome;

    /// Current record snapshot
    async fn status(&self, execution_id: &Uuid) -> Result<ExecutionRecord, EngineError>;

    /// Live progress events of an execution
    async fn subscribe(
        &self,
        execution_id: &Uuid,
    ) -> Result<tokio::sync::broadcast::Receiver<ProgressEvent>, EngineError>;

    /// Buffered events, most recent `limit` if given
    async fn events(
        &self,
        execution_id: &Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<ProgressEvent>, EngineError>;
}
