//! Shared fixtures for the engine tests

#![allow(dead_code)]

use chrono::Duration as ChronoDuration;
use futures::stream::{self, StreamExt};
use image::{Rgb, RgbImage};
use imgflow::{
    ActionRegistry, Database, EngineConfig, ExecutionRecorder, RecorderError, SourceRegistry,
    WorkflowRunner,
};
use imgflow_sdk::{
    async_trait, ActionMetadata, ActionSchema, Artifact, EngineError, ExecutionRecord,
    ImageHandle, ItemFetchError, OpenedSource, Parameters, ProgressEvent, SourceContext, SourceDescriptor,
    SourceError, SourceKind, SourceProvider, StepAction, StepInput, StepOutcome, StepScope,
    WorkflowRuntime, WorkingContext,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    RgbImage::from_pixel(w, h, Rgb([120, 80, 40])).save(&path).unwrap();
    path
}

pub fn write_corrupt(dir: &Path, name: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, b"\x89PNG but not really").unwrap();
    path
}

/// Scratch space, input and output folders, and an in-memory database
pub struct TestEnv {
    pub dir: TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
    pub db: Arc<Database>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        std::fs::create_dir_all(&input).unwrap();
        Self {
            input,
            output,
            db: Arc::new(Database::open_in_memory().unwrap()),
            dir,
        }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            output_directory: self.output.clone(),
            temp_directory: self.dir.path().join("tmp"),
            database_path: self.dir.path().join("executions.db"),
            log_directory: Some(self.dir.path().join("logs")),
            recorder_retries: 1,
            recorder_retry_delay_ms: 1,
            ..EngineConfig::default()
        }
    }

    pub fn runner(&self) -> WorkflowRunner {
        WorkflowRunner::new(self.config(), self.db.clone())
    }

    /// Built-in actions plus the test actions, built-in sources plus `extra`
    pub fn runner_with(
        &self,
        config: EngineConfig,
        recorder: Arc<dyn ExecutionRecorder>,
        extra: Vec<Arc<dyn SourceProvider>>,
    ) -> WorkflowRunner {
        let mut actions = ActionRegistry::with_builtins();
        actions.register(Arc::new(FailingBatchStep));
        actions.register(Arc::new(SlowStep));
        actions.register(Arc::new(PanicStep));
        let mut sources = SourceRegistry::with_builtins(&config);
        for provider in extra {
            sources.register(provider);
        }
        WorkflowRunner::with_registries(config, actions, sources, recorder)
    }

    /// Test runner that also knows the `gated` source
    pub fn gated_runner(&self, gated: &Arc<GatedSource>) -> WorkflowRunner {
        let provider: Arc<dyn SourceProvider> = gated.clone();
        self.runner_with(self.config(), self.db.clone(), vec![provider])
    }
}

fn schema(id: &str, scope: StepScope) -> ActionSchema {
    ActionSchema {
        metadata: ActionMetadata {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            category: "test".to_string(),
        },
        scope,
        params: Vec::new(),
    }
}

/// Batch step that always fails
pub struct FailingBatchStep;

#[async_trait]
impl StepAction for FailingBatchStep {
    fn schema(&self) -> ActionSchema {
        schema("failing_batch", StepScope::Batch)
    }

    async fn apply(&self, _: StepInput<'_>, _: &Parameters, _: &WorkingContext) -> StepOutcome {
        StepOutcome::failed("manifest target is read-only")
    }
}

/// Per-image step that sleeps for a while and passes the image on unchanged
pub struct SlowStep;

pub const SLOW_STEP_MS: u64 = 1500;

#[async_trait]
impl StepAction for SlowStep {
    fn schema(&self) -> ActionSchema {
        schema("slow", StepScope::PerImage)
    }

    async fn apply(&self, _: StepInput<'_>, _: &Parameters, _: &WorkingContext) -> StepOutcome {
        tokio::time::sleep(Duration::from_millis(SLOW_STEP_MS)).await;
        StepOutcome::Success(Artifact::unchanged())
    }
}

pub struct PanicStep;

#[async_trait]
impl StepAction for PanicStep {
    fn schema(&self) -> ActionSchema {
        schema("panic", StepScope::PerImage)
    }

    async fn apply(&self, input: StepInput<'_>, _: &Parameters, _: &WorkingContext) -> StepOutcome {
        if let StepInput::Image(image) = input {
            if image.index == 1 {
                panic!("step exploded on {}", image.name);
            }
        }
        StepOutcome::Success(Artifact::unchanged())
    }
}

/// Source that hands out one image per permit, so tests decide when images arrive
pub struct GatedSource {
    pub gate: Arc<Semaphore>,
    pub images: Vec<PathBuf>,
}

impl GatedSource {
    pub fn new(images: Vec<PathBuf>) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            images,
        }
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl SourceProvider for GatedSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            id: "gated".to_string(),
            name: "Gated".to_string(),
            description: String::new(),
            kind: SourceKind::Local,
            params: Vec::new(),
        }
    }

    async fn open(
        &self,
        _params: &Parameters,
        _ctx: &SourceContext,
    ) -> Result<OpenedSource, SourceError> {
        let gate = self.gate.clone();
        let total = self.images.len() as u64;
        let items: Vec<(u64, PathBuf)> = self
            .images
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, p)| (i as u64, p))
            .collect();
        let images = stream::iter(items)
            .then(move |(index, path)| {
                let gate = gate.clone();
                async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    Ok::<_, ItemFetchError>(ImageHandle::new(index, path))
                }
            })
            .boxed();
        Ok(OpenedSource {
            images,
            total_hint: Some(total),
        })
    }
}

/// Recorder that fails a chosen range of `save` calls and delegates the rest
pub struct FlakyRecorder {
    pub inner: Database,
    pub saves: AtomicUsize,
    /// `save` calls (0-based) from this one on fail
    pub fail_from: usize,
}

impl FlakyRecorder {
    pub fn failing_from(fail_from: usize) -> Self {
        Self {
            inner: Database::open_in_memory().unwrap(),
            saves: AtomicUsize::new(0),
            fail_from,
        }
    }
}

impl ExecutionRecorder for FlakyRecorder {
    fn save(&self, record: &ExecutionRecord) -> Result<(), RecorderError> {
        let call = self.saves.fetch_add(1, Ordering::SeqCst);
        if call >= self.fail_from {
            return Err(RecorderError::Task("disk full".to_string()));
        }
        self.inner.save(record)
    }

    fn get(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RecorderError> {
        self.inner.get(id)
    }

    fn list(&self) -> Result<Vec<ExecutionRecord>, RecorderError> {
        self.inner.list()
    }

    fn delete(&self, id: &Uuid) -> Result<bool, RecorderError> {
        self.inner.delete(id)
    }

    fn prune(&self, older_than: ChronoDuration) -> Result<usize, RecorderError> {
        self.inner.prune(older_than)
    }
}

/// Poll `status` until `done` holds (at most ~10s)
pub async fn wait_until<F>(runner: &WorkflowRunner, id: &Uuid, done: F) -> ExecutionRecord
where
    F: Fn(&ExecutionRecord) -> bool,
{
    for _ in 0..1000 {
        let record = runner.status(id).await.unwrap();
        if done(&record) {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached for execution {}", id);
}

/// Every `Progress` event published for the execution, in order
pub async fn progress_events(runner: &WorkflowRunner, id: &Uuid) -> Vec<(u64, u64, u64)> {
    runner
        .events(id, None)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::Progress {
                processed,
                success,
                failed,
                ..
            } => Some((processed, success, failed)),
            _ => None,
        })
        .collect()
}

pub fn expect_config_error(err: EngineError) -> Vec<String> {
    match err {
        EngineError::Config(problems) => problems,
        other => panic!("expected a config error, got {other:?}"),
    }
}
