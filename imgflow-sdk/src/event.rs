use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::record::ExecutionStatus;

/// Progress events published by the runner for one execution.
///
/// Events are immutable snapshots; subscribers never see shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ExecutionStarted {
        workflow_id: String,
        workflow_name: String,
        source_type: String,
    },
    SourceOpened {
        total_hint: Option<u64>,
    },
    ImageStarted {
        index: u64,
        name: String,
    },
    ImageSucceeded {
        index: u64,
        name: String,
        output: Option<PathBuf>,
    },
    ImageSkipped {
        index: u64,
        name: String,
        step_id: String,
        reason: String,
    },
    ImageFailed {
        index: u64,
        name: String,
        step_id: String,
        error: String,
    },
    /// Counter snapshot, sent after every processed image
    Progress {
        processed: u64,
        total: u64,
        success: u64,
        failed: u64,
    },
    BatchStepStarted {
        step_id: String,
        action: String,
    },
    BatchStepCompleted {
        step_id: String,
        action: String,
    },
    BatchStepFailed {
        step_id: String,
        action: String,
        error: String,
    },
    CancelRequested {
        processed: u64,
    },
    ExecutionFinished {
        status: ExecutionStatus,
        processed: u64,
        success: u64,
        failed: u64,
        error: Option<String>,
    },
    /// The record could not be saved after all retries
    RecordPersistFailed {
        error: String,
    },
}

impl ProgressEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, ProgressEvent::ExecutionFinished { .. })
    }
}
