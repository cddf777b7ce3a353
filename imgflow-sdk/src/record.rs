//! Execution records and their step log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::model::{SourceConfig, Workflow};
use crate::schema::Parameters;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Status of one step log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Started,
    Completed,
    Skipped,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Started => "started",
            LogStatus::Completed => "completed",
            LogStatus::Skipped => "skipped",
            LogStatus::Failed => "failed",
        }
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(LogStatus::Started),
            "completed" => Ok(LogStatus::Completed),
            "skipped" => Ok(LogStatus::Skipped),
            "failed" => Ok(LogStatus::Failed),
            other => Err(format!("unknown log status '{}'", other)),
        }
    }
}

/// Step id used for log entries that belong to the source rather than a workflow step.
pub const SOURCE_STEP: &str = "source";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    /// Workflow step id, or [`SOURCE_STEP`]
    pub step_id: String,
    pub action: String,
    pub status: LogStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Name of the image the entry is about, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl StepLogEntry {
    pub fn new(
        step_id: impl Into<String>,
        action: impl Into<String>,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            action: action.into(),
            status,
            timestamp: Utc::now(),
            message: message.into(),
            image: None,
        }
    }

    pub fn for_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Durable outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub source_type: String,
    pub source_parameters: Parameters,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub total_images: u64,
    pub processed_images: u64,
    pub success_images: u64,
    pub failed_images: u64,
    pub output_directory: PathBuf,
    pub error_message: Option<String>,
    pub step_log: Vec<StepLogEntry>,
}

impl ExecutionRecord {
    /// Fresh record for an execution that is starting now.
    pub fn start(
        id: Uuid,
        workflow: &Workflow,
        source: &SourceConfig,
        output_directory: PathBuf,
    ) -> Self {
        Self {
            id,
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            source_type: source.source_type.clone(),
            source_parameters: source.parameters.clone(),
            start_time: Utc::now(),
            end_time: None,
            status: ExecutionStatus::Running,
            total_images: 0,
            processed_images: 0,
            success_images: 0,
            failed_images: 0,
            output_directory,
            error_message: None,
            step_log: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move into a terminal status. Only the first call has any effect;
    /// returns whether this call finalized the record.
    pub fn finalize(&mut self, status: ExecutionStatus, error: Option<String>) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        self.error_message = match status {
            ExecutionStatus::Failed => error.or_else(|| Some("execution failed".to_string())),
            _ => None,
        };
        true
    }

    pub fn push_log(&mut self, entry: StepLogEntry) {
        self.step_log.push(entry);
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    /// Log entries with `Failed` status.
    pub fn failures(&self) -> impl Iterator<Item = &StepLogEntry> {
        self.step_log
            .iter()
            .filter(|e| e.status == LogStatus::Failed)
    }
}
