use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;
use imgflow_sdk::{
    async_trait, ActionSchema, CancelOutcome, EngineError, ExecutionRecord, ExecutionStatus,
    LogStatus, ProgressEvent, SourceConfig, SourceContext, SourceDescriptor, StepLogEntry,
    Workflow, WorkflowRuntime, SOURCE_STEP,
};

use crate::bus::ProgressBus;
use crate::config::EngineConfig;
use crate::pipeline::Pipeline;
use crate::recorder::{persist_with_retry, ExecutionRecorder};
use crate::registry::{ActionRegistry, SourceRegistry};

/// Internal state for an execution started by this runner
struct ExecutionState {
    workflow_id: String,
    bus: ProgressBus,
    record: watch::Receiver<ExecutionRecord>,
    cancel: CancellationToken,
}

impl ExecutionState {
    fn is_terminal(&self) -> bool {
        self.record.borrow().is_terminal()
    }
}

/// In-process workflow runner.
///
/// One execution may be active at a time; start a second runner to run
/// workflows side by side.
pub struct WorkflowRunner {
    /// Snapshot handed to each new execution
    config: Mutex<Arc<EngineConfig>>,
    actions: Arc<ActionRegistry>,
    sources: Arc<SourceRegistry>,
    recorder: Arc<dyn ExecutionRecorder>,
    /// Executions started by this runner (uuid -> state)
    executions: Arc<Mutex<HashMap<Uuid, ExecutionState>>>,
    /// The execution currently holding the runner
    active: Arc<Mutex<Option<Uuid>>>,
}

impl WorkflowRunner {
    /// Runner with the built-in actions and sources
    pub fn new(config: EngineConfig, recorder: Arc<dyn ExecutionRecorder>) -> Self {
        let sources = SourceRegistry::with_builtins(&config);
        Self::with_registries(config, ActionRegistry::with_builtins(), sources, recorder)
    }

    pub fn with_registries(
        config: EngineConfig,
        actions: ActionRegistry,
        sources: SourceRegistry,
        recorder: Arc<dyn ExecutionRecorder>,
    ) -> Self {
        Self {
            config: Mutex::new(Arc::new(config)),
            actions: Arc::new(actions),
            sources: Arc::new(sources),
            recorder,
            executions: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.lock().unwrap().clone()
    }

    /// Replace the configuration for executions started from now on
    pub fn update_config(&self, config: EngineConfig) {
        *self.config.lock().unwrap() = Arc::new(config);
    }

    /// The execution currently running, if any
    pub fn active_execution(&self) -> Option<Uuid> {
        *self.active.lock().unwrap()
    }

    /// Wait until the execution has ended and return its final record.
    ///
    /// Returns once the final save was attempted, the scratch directory removed and
    /// `ExecutionFinished` published. `status` already reports the terminal state
    /// before that.
    pub async fn wait(&self, execution_id: &Uuid) -> Result<ExecutionRecord, EngineError> {
        let rx = {
            let executions = self.executions.lock().unwrap();
            executions.get(execution_id).map(|state| state.record.clone())
        };
        let Some(mut rx) = rx else {
            return self.status(execution_id).await;
        };
        // The pipeline drops its sender when it is done
        while rx.changed().await.is_ok() {}
        let record = rx.borrow().clone();
        if !record.is_terminal() {
            info!(execution_id = %execution_id, "Execution ended without a terminal snapshot");
        }
        Ok(record)
    }

    /// Clean up finished executions
    /// Removes in-memory state for executions that are terminal; their records stay in the recorder
    pub fn cleanup_completed_executions(&self) {
        let mut execs = self.executions.lock().unwrap();
        execs.retain(|_, state| !state.is_terminal());
    }

    /// Ids of executions held in memory for `workflow_id`
    pub fn executions_for(&self, workflow_id: &str) -> Vec<Uuid> {
        let execs = self.executions.lock().unwrap();
        execs
            .iter()
            .filter(|(_, state)| state.workflow_id == workflow_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Text log of an execution held in memory, when one is being written
    pub fn log_path(&self, execution_id: &Uuid) -> Option<PathBuf> {
        let executions = self.executions.lock().unwrap();
        executions
            .get(execution_id)
            .and_then(|state| state.bus.log_path().map(Path::to_path_buf))
    }

    /// Claim the runner for `execution_id`
    fn reserve(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let mut active = self.active.lock().unwrap();
        if let Some(running) = *active {
            return Err(EngineError::RunnerBusy(running));
        }
        *active = Some(execution_id);
        Ok(())
    }

    fn release(&self, execution_id: Uuid) {
        let mut active = self.active.lock().unwrap();
        if *active == Some(execution_id) {
            *active = None;
        }
    }

    async fn load_record(&self, execution_id: &Uuid) -> Result<Option<ExecutionRecord>, EngineError> {
        let recorder = self.recorder.clone();
        let id = *execution_id;
        tokio::task::spawn_blocking(move || recorder.get(&id))
            .await
            .map_err(|e| EngineError::Recorder(e.to_string()))?
            .map_err(|e| EngineError::Recorder(e.to_string()))
    }
}

fn create_dir(path: &Path, what: &str) -> Result<(), EngineError> {
    std::fs::create_dir_all(path).map_err(|e| {
        EngineError::config(format!(
            "cannot create {} directory {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

#[async_trait]
impl WorkflowRuntime for WorkflowRunner {
    fn list_actions(&self) -> Vec<ActionSchema> {
        self.actions.list()
    }

    fn list_sources(&self) -> Vec<SourceDescriptor> {
        self.sources.list()
    }

    fn validate(&self, workflow: &Workflow, source: &SourceConfig) -> Result<(), EngineError> {
        let mut problems = match self.actions.validate_workflow(workflow) {
            Ok(_) => Vec::new(),
            Err(problems) => problems,
        };
        if let Err(source_problems) = self.sources.resolve(source) {
            problems.extend(source_problems);
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(problems))
        }
    }

    async fn start(
        &self,
        workflow: Workflow,
        source: SourceConfig,
        output_dir: Option<PathBuf>,
    ) -> Result<Uuid, EngineError> {
        let execution_id = Uuid::new_v4();
        self.reserve(execution_id)?;

        let config = self.config();
        let (steps, provider) = match (
            self.actions.validate_workflow(&workflow),
            self.sources.resolve(&source),
        ) {
            (Ok(steps), Ok(provider)) => (steps, provider),
            (steps, provider) => {
                self.release(execution_id);
                let mut problems = steps.err().unwrap_or_default();
                problems.extend(provider.err().unwrap_or_default());
                return Err(EngineError::Config(problems));
            }
        };
        let output_dir = output_dir.unwrap_or_else(|| config.output_directory.clone());
        if let Err(e) = create_dir(&output_dir, "output") {
            self.release(execution_id);
            return Err(e);
        }
        let scratch_dir = config
            .temp_directory
            .join(format!("imgflow-{}", execution_id));
        if let Err(e) = create_dir(&scratch_dir, "scratch") {
            self.release(execution_id);
            return Err(e);
        }

        let mut record = ExecutionRecord::start(execution_id, &workflow, &source, output_dir);
        record.push_log(StepLogEntry::new(
            SOURCE_STEP,
            source.source_type.clone(),
            LogStatus::Started,
            format!("opening {} source", source.source_type),
        ));
        if let Err(e) = persist_with_retry(
            self.recorder.clone(),
            record.clone(),
            config.recorder_retries,
            std::time::Duration::from_millis(config.recorder_retry_delay_ms),
        )
        .await
        {
            error!(execution_id = %execution_id, error = %e, "Failed to create execution record");
            self.release(execution_id);
            let _ = std::fs::remove_dir_all(&scratch_dir);
            return Err(EngineError::Recorder(e.to_string()));
        }

        let mut bus = ProgressBus::new(config.event_capacity);
        if let Some(dir) = &config.log_directory {
            let path = dir.join(format!("{}_log.txt", execution_id));
            if let Err(e) = bus.attach_log_file(&path) {
                warn!(path = %path.display(), error = %e, "Execution log file unavailable");
            }
        }
        let (record_tx, record_rx) = watch::channel(record.clone());
        let cancel = CancellationToken::new();
        self.executions.lock().unwrap().insert(
            execution_id,
            ExecutionState {
                workflow_id: workflow.id.clone(),
                bus: bus.clone(),
                record: record_rx,
                cancel: cancel.clone(),
            },
        );

        info!(
            execution_id = %execution_id,
            workflow = %workflow.name,
            source = %source.source_type,
            "Starting execution"
        );
        bus.publish(ProgressEvent::ExecutionStarted {
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            source_type: source.source_type.clone(),
        });

        let mut pipeline = Pipeline {
            record,
            steps,
            config: config.clone(),
            recorder: self.recorder.clone(),
            bus,
            record_tx,
            cancel,
            scratch_dir: scratch_dir.clone(),
            active: self.active.clone(),
        };

        let mut ctx = SourceContext::new(execution_id, scratch_dir);
        if let Some(settings) = config.sources.get(&source.source_type) {
            ctx = ctx.with_settings(settings.to_parameters());
        }
        let opened = match provider.open(&source.parameters, &ctx).await {
            Ok(opened) => opened,
            Err(source_error) => {
                error!(execution_id = %execution_id, error = %source_error, "Source failed to open");
                let message = source_error.to_string();
                pipeline.record.push_log(StepLogEntry::new(
                    SOURCE_STEP,
                    source.source_type.clone(),
                    LogStatus::Failed,
                    message.clone(),
                ));
                pipeline
                    .finish(ExecutionStatus::Failed, Some(format!("source failed: {}", message)))
                    .await;
                return Err(EngineError::Source {
                    execution_id,
                    source_type: source.source_type,
                    source: source_error,
                });
            }
        };

        let span = tracing::info_span!("execution", id = %execution_id, workflow = %workflow.name);
        tokio::spawn(pipeline.run(opened).instrument(span));

        Ok(execution_id)
    }

    async fn cancel(&self, execution_id: &Uuid) -> CancelOutcome {
        let held = {
            let executions = self.executions.lock().unwrap();
            executions
                .get(execution_id)
                .map(|state| (state.is_terminal(), state.cancel.clone()))
        };

        match held {
            Some((true, _)) => CancelOutcome::AlreadyTerminal,
            Some((false, token)) => {
                info!(execution_id = %execution_id, "Cancel requested");
                token.cancel();
                CancelOutcome::Accepted
            }
            None => match self.load_record(execution_id).await {
                Ok(Some(record)) if record.is_terminal() => CancelOutcome::AlreadyTerminal,
                _ => CancelOutcome::NotFound,
            },
        }
    }

    async fn status(&self, execution_id: &Uuid) -> Result<ExecutionRecord, EngineError> {
        let snapshot = {
            let executions = self.executions.lock().unwrap();
            executions
                .get(execution_id)
                .map(|state| state.record.borrow().clone())
        };
        if let Some(record) = snapshot {
            return Ok(record);
        }
        self.load_record(execution_id)
            .await?
            .ok_or(EngineError::NotFound(*execution_id))
    }

    async fn subscribe(
        &self,
        execution_id: &Uuid,
    ) -> Result<broadcast::Receiver<ProgressEvent>, EngineError> {
        let executions = self.executions.lock().unwrap();
        let state = executions
            .get(execution_id)
            .ok_or(EngineError::NotFound(*execution_id))?;
        Ok(state.bus.subscribe())
    }

    async fn events(
        &self,
        execution_id: &Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<ProgressEvent>, EngineError> {
        let executions = self.executions.lock().unwrap();
        let state = executions
            .get(execution_id)
            .ok_or(EngineError::NotFound(*execution_id))?;
        Ok(state.bus.history(limit))
    }
}
