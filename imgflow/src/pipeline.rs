//! Execution pipeline: drives one opened source through the resolved step chain
//!
//! The pipeline owns the in-flight [`ExecutionRecord`]. Everything else sees it
//! through the watch channel snapshots and the progress bus.

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use imgflow_sdk::{
    claim_unique_path, ExecutionRecord, ExecutionStatus, ImageHandle, ItemFetchError, LogStatus,
    OpenedSource, ProgressEvent, StepInput, StepLogEntry, StepOutcome, StepScope,
    WorkingContext, SOURCE_STEP,
};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::ProgressBus;
use crate::config::EngineConfig;
use crate::recorder::{persist_with_retry, ExecutionRecorder};
use crate::registry::ResolvedStep;

/// How one image left the step chain
#[derive(Debug)]
enum ImageResult {
    /// Every per-image step succeeded; the handle points at the final file
    Succeeded(ImageHandle),
    /// A step filtered the image out; steps before `at` succeeded
    Skipped {
        image: ImageHandle,
        at: usize,
        reason: String,
    },
    Failed {
        image: ImageHandle,
        at: usize,
        error: String,
    },
    /// Cancellation was seen between two steps; the image is not counted
    Interrupted,
}

/// Everything a single image needs, owned so images can run side by side
#[derive(Clone)]
struct ImageJob {
    execution_id: Uuid,
    steps: Arc<Vec<ResolvedStep>>,
    output_dir: PathBuf,
    scratch_dir: PathBuf,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ImageJob {
    fn context(&self, position: usize, image_index: u64) -> WorkingContext {
        let step = &self.steps[position];
        WorkingContext {
            execution_id: self.execution_id,
            output_dir: self.output_dir.clone(),
            scratch_dir: self.scratch_dir.clone(),
            step_id: step.step.id.clone(),
            step_index: step.index,
            image_index: Some(image_index),
            final_stage: position + 1 == self.steps.len(),
        }
    }

    async fn run(self, image: ImageHandle) -> ImageResult {
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut current = image;

        for position in 0..self.steps.len() {
            if self.cancel.is_cancelled() {
                return ImageResult::Interrupted;
            }
            let resolved = &self.steps[position];
            let ctx = self.context(position, current.index);

            let apply = AssertUnwindSafe(resolved.action.apply(
                StepInput::Image(&current),
                &resolved.step.parameters,
                &ctx,
            ))
            .catch_unwind();

            let outcome = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, apply).await {
                    Ok(result) => result,
                    Err(_) => {
                        return ImageResult::Failed {
                            image: current,
                            at: position,
                            error: format!(
                                "timed out after {}s",
                                self.timeout.unwrap_or_default().as_secs()
                            ),
                        }
                    }
                },
                None => apply.await,
            };

            match outcome {
                Ok(StepOutcome::Success(artifact)) => current = current.advance(&artifact),
                Ok(StepOutcome::Skipped(reason)) => {
                    return ImageResult::Skipped {
                        image: current,
                        at: position,
                        reason,
                    }
                }
                Ok(StepOutcome::Failed(error)) => {
                    return ImageResult::Failed {
                        image: current,
                        at: position,
                        error,
                    }
                }
                Err(panic) => {
                    return ImageResult::Failed {
                        image: current,
                        at: position,
                        error: format!("step panicked: {}", panic_message(&panic)),
                    }
                }
            }
        }

        match self.place_output(&current).await {
            Ok(path) => {
                current.path = path;
                ImageResult::Succeeded(current)
            }
            Err(error) => ImageResult::Failed {
                image: current,
                at: self.steps.len().saturating_sub(1),
                error,
            },
        }
    }

    /// Copy the final file into the output directory unless a step already wrote it there
    async fn place_output(&self, image: &ImageHandle) -> Result<PathBuf, String> {
        if image.path.starts_with(&self.output_dir) {
            return Ok(image.path.clone());
        }
        let file_name = image
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| image.name.clone());
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| format!("cannot create {}: {}", self.output_dir.display(), e))?;
        let target = claim_unique_path(&self.output_dir, &file_name)
            .map_err(|e| format!("cannot place output {}: {}", file_name, e))?;
        if let Err(e) = tokio::fs::copy(&image.path, &target).await {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(format!("cannot place output {}: {}", target.display(), e));
        }
        Ok(target)
    }
}

/// Step id and action for a log entry; failures with no per-image step belong to the output stage
fn step_label(steps: &[ResolvedStep], at: usize) -> (String, String) {
    match steps.get(at) {
        Some(resolved) => (resolved.step.id.clone(), resolved.step.action.clone()),
        None => ("output".to_string(), "output".to_string()),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One execution after its source was opened (or failed to open)
pub(crate) struct Pipeline {
    pub record: ExecutionRecord,
    pub steps: Vec<ResolvedStep>,
    pub config: Arc<EngineConfig>,
    pub recorder: Arc<dyn ExecutionRecorder>,
    pub bus: ProgressBus,
    pub record_tx: watch::Sender<ExecutionRecord>,
    pub cancel: CancellationToken,
    pub scratch_dir: PathBuf,
    /// Runner slot to release when the execution ends
    pub active: Arc<Mutex<Option<Uuid>>>,
}

impl Pipeline {
    fn id(&self) -> Uuid {
        self.record.id
    }

    fn publish_record(&self) {
        self.record_tx.send_replace(self.record.clone());
    }

    fn progress_event(&self) -> ProgressEvent {
        ProgressEvent::Progress {
            processed: self.record.processed_images,
            total: self.record.total_images,
            success: self.record.success_images,
            failed: self.record.failed_images,
        }
    }

    async fn persist(&self) -> bool {
        let result = persist_with_retry(
            self.recorder.clone(),
            self.record.clone(),
            self.config.recorder_retries,
            Duration::from_millis(self.config.recorder_retry_delay_ms),
        )
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(execution_id = %self.id(), error = %e, "Execution record could not be saved");
                self.bus.publish(ProgressEvent::RecordPersistFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Finalize exactly once, persist, release the runner and announce the end.
    pub async fn finish(mut self, status: ExecutionStatus, error: Option<String>) -> ExecutionRecord {
        if !self.record.finalize(status, error) {
            warn!(execution_id = %self.id(), "Execution already finalized");
            return self.record;
        }
        // Observers see the terminal status before the (possibly retried) save
        self.publish_record();
        self.persist().await;

        match tokio::fs::remove_dir_all(&self.scratch_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.scratch_dir.display(), error = %e, "Failed to remove scratch directory"),
        }

        {
            let mut active = self.active.lock().unwrap();
            if *active == Some(self.record.id) {
                *active = None;
            }
        }
        self.publish_record();
        self.bus.publish(ProgressEvent::ExecutionFinished {
            status: self.record.status,
            processed: self.record.processed_images,
            success: self.record.success_images,
            failed: self.record.failed_images,
            error: self.record.error_message.clone(),
        });

        info!(
            execution_id = %self.record.id,
            status = %self.record.status,
            processed = self.record.processed_images,
            success = self.record.success_images,
            failed = self.record.failed_images,
            "Execution finished"
        );
        self.record
    }

    /// Source opened: note it in the log and publish the first snapshot
    pub fn source_opened(&mut self, total_hint: Option<u64>) {
        let message = match total_hint {
            Some(n) => format!("source opened, {} image(s)", n),
            None => "source opened, image count unknown".to_string(),
        };
        let source_type = self.record.source_type.clone();
        self.record.push_log(StepLogEntry::new(
            SOURCE_STEP,
            source_type,
            LogStatus::Completed,
            message,
        ));
        if let Some(n) = total_hint {
            self.record.total_images = n;
        }
        self.publish_record();
        self.bus.publish(ProgressEvent::SourceOpened { total_hint });
    }

    /// Run the image loop and batch steps, then finalize.
    pub async fn run(mut self, opened: OpenedSource) -> ExecutionRecord {
        self.source_opened(opened.total_hint);
        let total_known = opened.total_hint.is_some();
        let mut images = opened.images;

        let (per_image, batch): (Vec<ResolvedStep>, Vec<ResolvedStep>) = self
            .steps
            .iter()
            .cloned()
            .partition(|s| s.scope == StepScope::PerImage);
        let per_image = Arc::new(per_image);
        let job = ImageJob {
            execution_id: self.id(),
            steps: per_image.clone(),
            output_dir: self.record.output_directory.clone(),
            scratch_dir: self.scratch_dir.clone(),
            timeout: self.config.image_timeout(),
            cancel: self.cancel.clone(),
        };

        let workers = self.config.worker_count();
        let checkpoint = self.config.checkpoint_interval;
        let mut step_success = vec![0u64; per_image.len()];
        let mut finals: Vec<ImageHandle> = Vec::new();
        let mut in_flight = FuturesUnordered::new();
        let mut pulled = 0u64;
        let mut exhausted = false;
        let mut cancel_seen = false;
        let cancel = self.cancel.clone();

        loop {
            let cancelled = cancel.is_cancelled();
            if in_flight.is_empty() && (exhausted || cancelled) {
                break;
            }

            tokio::select! {
                biased;

                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    let before = self.record.processed_images;
                    if let Some(done) = self.fold_image(result, &per_image, &mut step_success) {
                        finals.push(done);
                    }
                    let processed = self.record.processed_images;
                    if checkpoint > 0 && processed != before && processed % checkpoint == 0 {
                        debug!(execution_id = %self.id(), processed = self.record.processed_images, "Checkpoint");
                        self.persist().await;
                    }
                }

                item = images.next(), if !exhausted && !cancelled && in_flight.len() < workers => {
                    match item {
                        None => exhausted = true,
                        Some(Err(fetch_error)) => {
                            let index = fetch_error.index.unwrap_or(pulled);
                            pulled += 1;
                            if !total_known {
                                self.record.total_images += 1;
                            }
                            self.fold_fetch_error(index, fetch_error);
                        }
                        Some(Ok(image)) => {
                            pulled += 1;
                            // Checked again: the source may have yielded after the request
                            if cancel.is_cancelled() {
                                continue;
                            }
                            if !total_known {
                                self.record.total_images += 1;
                            }
                            self.bus.publish(ProgressEvent::ImageStarted {
                                index: image.index,
                                name: image.name.clone(),
                            });
                            in_flight.push(job.clone().run(image));
                        }
                    }
                }

                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!(execution_id = %self.id(), processed = self.record.processed_images, "Cancellation requested");
                    self.bus.publish(ProgressEvent::CancelRequested {
                        processed: self.record.processed_images,
                    });
                }

                else => break,
            }
        }
        drop(images);

        for (position, resolved) in per_image.iter().enumerate() {
            self.record.push_log(StepLogEntry::new(
                resolved.step.id.clone(),
                resolved.step.action.clone(),
                LogStatus::Completed,
                format!("{} image(s) passed", step_success[position]),
            ));
        }
        self.publish_record();

        if self.cancel.is_cancelled() {
            return self.finish(ExecutionStatus::Cancelled, None).await;
        }

        finals.sort_by_key(|img| img.index);
        for resolved in &batch {
            if self.cancel.is_cancelled() {
                return self.finish(ExecutionStatus::Cancelled, None).await;
            }
            if let Err(error) = self.run_batch_step(resolved, &finals).await {
                return self.finish(ExecutionStatus::Failed, Some(error)).await;
            }
        }

        self.finish(ExecutionStatus::Completed, None).await
    }

    /// Fold one finished image into the record; returns the final handle on success
    fn fold_image(
        &mut self,
        result: ImageResult,
        steps: &[ResolvedStep],
        step_success: &mut [u64],
    ) -> Option<ImageHandle> {
        let mut done = None;
        match result {
            ImageResult::Interrupted => return None,
            ImageResult::Succeeded(image) => {
                step_success.iter_mut().for_each(|n| *n += 1);
                self.record.processed_images += 1;
                self.record.success_images += 1;
                self.bus.publish(ProgressEvent::ImageSucceeded {
                    index: image.index,
                    name: image.name.clone(),
                    output: Some(image.path.clone()),
                });
                done = Some(image);
            }
            ImageResult::Skipped { image, at, reason } => {
                let passed = at.min(step_success.len());
                step_success[..passed].iter_mut().for_each(|n| *n += 1);
                let (step_id, action) = step_label(steps, at);
                self.record.processed_images += 1;
                self.record.success_images += 1;
                self.record.push_log(
                    StepLogEntry::new(step_id.clone(), action, LogStatus::Skipped, reason.clone())
                        .for_image(image.name.clone()),
                );
                self.bus.publish(ProgressEvent::ImageSkipped {
                    index: image.index,
                    name: image.name,
                    step_id,
                    reason,
                });
            }
            ImageResult::Failed { image, at, error } => {
                let passed = at.min(step_success.len());
                step_success[..passed].iter_mut().for_each(|n| *n += 1);
                let (step_id, action) = step_label(steps, at);
                warn!(
                    execution_id = %self.id(),
                    image = %image.name,
                    step = %action,
                    error = %error,
                    "Image failed"
                );
                self.record.processed_images += 1;
                self.record.failed_images += 1;
                self.record.push_log(
                    StepLogEntry::new(step_id.clone(), action, LogStatus::Failed, error.clone())
                        .for_image(image.name.clone()),
                );
                self.bus.publish(ProgressEvent::ImageFailed {
                    index: image.index,
                    name: image.name,
                    step_id,
                    error,
                });
            }
        }
        self.publish_record();
        self.bus.publish(self.progress_event());
        done
    }

    /// A source item that could not be fetched counts as a failed image
    fn fold_fetch_error(&mut self, index: u64, fetch_error: ItemFetchError) {
        warn!(execution_id = %self.id(), item = %fetch_error.item, error = %fetch_error.reason, "Source item failed");
        let source_type = self.record.source_type.clone();
        self.record.processed_images += 1;
        self.record.failed_images += 1;
        self.record.push_log(
            StepLogEntry::new(
                SOURCE_STEP,
                source_type,
                LogStatus::Failed,
                fetch_error.reason.clone(),
            )
            .for_image(fetch_error.item.clone()),
        );
        self.bus.publish(ProgressEvent::ImageFailed {
            index,
            name: fetch_error.item,
            step_id: SOURCE_STEP.to_string(),
            error: fetch_error.reason,
        });
        self.publish_record();
        self.bus.publish(self.progress_event());
    }

    async fn run_batch_step(
        &mut self,
        resolved: &ResolvedStep,
        images: &[ImageHandle],
    ) -> Result<(), String> {
        let step = &resolved.step;
        let ctx = WorkingContext {
            execution_id: self.id(),
            output_dir: self.record.output_directory.clone(),
            scratch_dir: self.scratch_dir.clone(),
            step_id: step.id.clone(),
            step_index: resolved.index,
            image_index: None,
            final_stage: true,
        };

        self.record.push_log(StepLogEntry::new(
            step.id.clone(),
            step.action.clone(),
            LogStatus::Started,
            format!("running on {} image(s)", images.len()),
        ));
        self.bus.publish(ProgressEvent::BatchStepStarted {
            step_id: step.id.clone(),
            action: step.action.clone(),
        });

        let outcome = AssertUnwindSafe(resolved.action.apply(
            StepInput::Batch(images),
            &step.parameters,
            &ctx,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            StepOutcome::failed(format!("step panicked: {}", panic_message(&panic)))
        });

        let result = match outcome {
            StepOutcome::Success(artifact) => {
                let message = match &artifact.path {
                    Some(path) => format!("wrote {}", path.display()),
                    None => "completed".to_string(),
                };
                self.record.push_log(StepLogEntry::new(
                    step.id.clone(),
                    step.action.clone(),
                    LogStatus::Completed,
                    message,
                ));
                self.bus.publish(ProgressEvent::BatchStepCompleted {
                    step_id: step.id.clone(),
                    action: step.action.clone(),
                });
                Ok(())
            }
            StepOutcome::Skipped(reason) => {
                self.record.push_log(StepLogEntry::new(
                    step.id.clone(),
                    step.action.clone(),
                    LogStatus::Skipped,
                    reason,
                ));
                self.bus.publish(ProgressEvent::BatchStepCompleted {
                    step_id: step.id.clone(),
                    action: step.action.clone(),
                });
                Ok(())
            }
            StepOutcome::Failed(error) => {
                error!(execution_id = %self.id(), step = %step.action, error = %error, "Batch step failed");
                self.record.push_log(StepLogEntry::new(
                    step.id.clone(),
                    step.action.clone(),
                    LogStatus::Failed,
                    error.clone(),
                ));
                self.bus.publish(ProgressEvent::BatchStepFailed {
                    step_id: step.id.clone(),
                    action: step.action.clone(),
                    error: error.clone(),
                });
                Err(format!("batch step '{}' failed: {}", step.action, error))
            }
        };
        self.publish_record();
        result
    }
}
