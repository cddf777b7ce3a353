//! Execution recorder: durable store of execution records

use chrono::Duration as ChronoDuration;
use imgflow_sdk::ExecutionRecord;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("recorder task failed: {0}")]
    Task(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage contract for execution records.
///
/// `save` is an upsert by id. Once a stored record is terminal it is never changed
/// again; while it is running only counters, status and log are updated.
pub trait ExecutionRecorder: Send + Sync {
    fn save(&self, record: &ExecutionRecord) -> Result<(), RecorderError>;

    fn get(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RecorderError>;

    /// All records, newest `start_time` first
    fn list(&self) -> Result<Vec<ExecutionRecord>, RecorderError>;

    /// Returns `false` if there was no such record
    fn delete(&self, id: &Uuid) -> Result<bool, RecorderError>;

    /// Remove records whose `start_time` is older than `older_than` ago
    fn prune(&self, older_than: ChronoDuration) -> Result<usize, RecorderError>;
}

/// Save `record` on the blocking pool, retrying `retries` more times with linear back-off.
pub async fn persist_with_retry(
    recorder: Arc<dyn ExecutionRecorder>,
    record: ExecutionRecord,
    retries: u32,
    delay: Duration,
) -> Result<(), RecorderError> {
    let record = Arc::new(record);
    let mut attempt = 0u32;

    loop {
        let rec = recorder.clone();
        let snapshot = record.clone();
        let result = tokio::task::spawn_blocking(move || rec.save(&snapshot))
            .await
            .map_err(|e| RecorderError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt < retries => {
                attempt += 1;
                warn!(
                    execution_id = %record.id,
                    attempt,
                    error = %err,
                    "Failed to save execution record, retrying"
                );
                tokio::time::sleep(delay * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}
