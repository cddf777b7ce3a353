//! Progress/log bus for one execution

use chrono::Utc;
use imgflow_sdk::ProgressEvent;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Broadcast channel plus a history buffer for late subscribers.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
    /// The most recent `capacity` events, oldest first
    buffer: Arc<Mutex<VecDeque<ProgressEvent>>>,
    capacity: usize,
    /// Text log of every event, kept after the execution ends
    log_file: Option<(PathBuf, Arc<Mutex<File>>)>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            log_file: None,
        }
    }

    /// Also append every published event to `path`, one timestamped line each
    pub fn attach_log_file(&mut self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.log_file = Some((path.to_path_buf(), Arc::new(Mutex::new(file))));
        Ok(())
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_file.as_ref().map(|(path, _)| path.as_path())
    }

    /// Never blocks; having no subscribers is fine
    pub fn publish(&self, event: ProgressEvent) {
        if let Ok(mut buffer) = self.buffer.lock() {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
        if let Some((_, file)) = &self.log_file {
            if let Ok(mut file) = file.lock() {
                let (level, message) = log_line(&event);
                let _ = writeln!(
                    file,
                    "{} - {} - {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    level,
                    message
                );
            }
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Buffered events in publish order; with `limit`, only the most recent ones
    pub fn history(&self, limit: Option<usize>) -> Vec<ProgressEvent> {
        let Ok(buffer) = self.buffer.lock() else {
            return Vec::new();
        };
        match limit {
            Some(limit) => buffer.iter().rev().take(limit).rev().cloned().collect(),
            None => buffer.iter().cloned().collect(),
        }
    }
}

/// Level and message for the text log
fn log_line(event: &ProgressEvent) -> (&'static str, String) {
    match event {
        ProgressEvent::ExecutionStarted {
            workflow_name,
            source_type,
            ..
        } => (
            "INFO",
            format!("running workflow '{}' on {} source", workflow_name, source_type),
        ),
        ProgressEvent::SourceOpened { total_hint: Some(n) } => {
            ("INFO", format!("source opened, {} image(s)", n))
        }
        ProgressEvent::SourceOpened { total_hint: None } => {
            ("INFO", "source opened, image count unknown".to_string())
        }
        ProgressEvent::ImageStarted { index, name } => {
            ("INFO", format!("image #{} {} started", index, name))
        }
        ProgressEvent::ImageSucceeded {
            index,
            name,
            output,
        } => match output {
            Some(path) => ("INFO", format!("image #{} {} saved to {}", index, name, path.display())),
            None => ("INFO", format!("image #{} {} done", index, name)),
        },
        ProgressEvent::ImageSkipped {
            index,
            name,
            step_id,
            reason,
        } => (
            "INFO",
            format!("image #{} {} skipped at {}: {}", index, name, step_id, reason),
        ),
        ProgressEvent::ImageFailed {
            index,
            name,
            step_id,
            error,
        } => (
            "ERROR",
            format!("image #{} {} failed at {}: {}", index, name, step_id, error),
        ),
        ProgressEvent::Progress {
            processed,
            total,
            success,
            failed,
        } => (
            "INFO",
            format!(
                "{}/{} processed ({} ok, {} failed)",
                processed, total, success, failed
            ),
        ),
        ProgressEvent::BatchStepStarted { action, .. } => {
            ("INFO", format!("batch step {} started", action))
        }
        ProgressEvent::BatchStepCompleted { action, .. } => {
            ("INFO", format!("batch step {} completed", action))
        }
        ProgressEvent::BatchStepFailed { action, error, .. } => {
            ("ERROR", format!("batch step {} failed: {}", action, error))
        }
        ProgressEvent::CancelRequested { processed } => (
            "WARNING",
            format!("cancellation requested after {} image(s)", processed),
        ),
        ProgressEvent::ExecutionFinished {
            status,
            processed,
            success,
            failed,
            error,
        } => {
            let level = if error.is_some() { "ERROR" } else { "INFO" };
            let mut message = format!(
                "execution {}: {} processed, {} ok, {} failed",
                status, processed, success, failed
            );
            if let Some(error) = error {
                message.push_str(&format!(" ({})", error));
            }
            (level, message)
        }
        ProgressEvent::RecordPersistFailed { error } => {
            ("ERROR", format!("execution record could not be saved: {}", error))
        }
    }
}
