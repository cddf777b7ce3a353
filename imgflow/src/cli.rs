//! Command-line front end for the runner, history and stores

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use imgflow_sdk::{
    log_debug, log_error, log_file_saved, log_found, log_info, log_progress, log_warning,
    CancelOutcome, ExecutionRecord, ExecutionStatus, ProgressEvent, SavedSource, SourceConfig,
    Workflow, WorkflowRuntime,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::database::Database;
use crate::recorder::ExecutionRecorder;
use crate::runtime::WorkflowRunner;
use crate::sources::apply_env_credentials;
use crate::utils::{export_workflow, import_workflow};

#[derive(Parser, Debug)]
#[command(name = "imgflow", version, about = "Run image workflows and browse their history")]
pub struct Cli {
    /// Config file (default: the per-user config location)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a workflow file or stored workflow against a source
    Run(RunArgs),
    /// List available step actions
    Actions,
    /// List available sources
    Sources,
    /// Browse execution history
    #[command(subcommand)]
    History(HistoryCommand),
    /// Manage stored workflows
    #[command(subcommand)]
    Workflow(WorkflowCommand),
    /// Manage saved source configurations
    #[command(subcommand)]
    Source(SourceCommand),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow file (.json/.yaml) or id of a stored workflow
    pub workflow: String,

    #[command(flatten)]
    pub source: SourceArgs,

    /// Use a saved source configuration
    #[arg(long, conflicts_with_all = ["dir", "source"])]
    pub saved: Option<String>,

    /// Output directory (default from config)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Images processed concurrently
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Per-image timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Also print when each image starts
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Local directory to read images from
    #[arg(short, long, conflicts_with = "source")]
    pub dir: Option<PathBuf>,

    /// Walk sub-directories of --dir
    #[arg(long, requires = "dir")]
    pub recursive: bool,

    /// Remote source type (e.g. danbooru, yandere)
    #[arg(short, long)]
    pub source: Option<String>,

    /// Comma-separated search tags for a remote source
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Maximum number of remote images
    #[arg(short, long)]
    pub limit: Option<u64>,
}

impl SourceArgs {
    fn is_empty(&self) -> bool {
        self.dir.is_none() && self.source.is_none()
    }

    fn to_config(&self) -> Result<SourceConfig> {
        if let Some(dir) = &self.dir {
            let mut config = SourceConfig::local(dir);
            if self.recursive {
                config
                    .parameters
                    .insert("recursive".to_string(), serde_json::Value::Bool(true));
            }
            return Ok(config);
        }
        let Some(source) = &self.source else {
            bail!("specify a source with --dir, --source or --saved");
        };
        Ok(SourceConfig::remote(source, self.tags.clone(), self.limit))
    }
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommand {
    /// List executions, newest first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only executions of this workflow
        #[arg(short, long)]
        workflow: Option<String>,
    },
    /// Show one execution with its step log
    Show { id: Uuid },
    /// Delete one execution record
    Delete { id: Uuid },
    /// Delete records older than the given number of days
    Prune {
        #[arg(long)]
        days: i64,
    },
    /// Execution counts by status
    Stats {
        #[arg(short, long)]
        workflow: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommand {
    /// Store a workflow from a JSON or YAML file
    Import { path: PathBuf },
    /// Write a stored workflow to a JSON or YAML file
    Export { id: String, path: PathBuf },
    List,
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum SourceCommand {
    /// Save a source configuration under a label
    Save {
        label: String,
        #[command(flatten)]
        source: SourceArgs,
    },
    List,
    Delete { label: String },
}

pub async fn execute(cli: Cli, config: EngineConfig) -> Result<()> {
    let db = Arc::new(
        Database::open(&config.database_path)
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?,
    );

    match cli.command {
        Command::Run(args) => run(args, config, db).await,
        Command::Actions => {
            let runner = WorkflowRunner::new(config, db);
            print_actions(&runner);
            Ok(())
        }
        Command::Sources => {
            let runner = WorkflowRunner::new(config, db);
            for source in runner.list_sources() {
                println!("{:<10} {:<10} {}", source.id, format!("{:?}", source.kind), source.description);
                for param in &source.params {
                    println!("    {:<12} {}", param.name, param_hint(param.required, &param.description));
                }
            }
            Ok(())
        }
        Command::History(cmd) => history(cmd, &db),
        Command::Workflow(cmd) => workflows(cmd, &db),
        Command::Source(cmd) => saved_sources(cmd, &db),
    }
}

fn param_hint(required: bool, description: &str) -> String {
    if required {
        format!("(required) {}", description)
    } else {
        description.to_string()
    }
}

fn print_actions(runner: &WorkflowRunner) {
    for action in runner.list_actions() {
        println!(
            "{:<10} [{}] {:?} - {}",
            action.metadata.id, action.metadata.category, action.scope, action.metadata.description
        );
        for param in &action.params {
            println!("    {:<12} {}", param.name, param_hint(param.required, &param.description));
        }
    }
}

/// Workflow from a file if `reference` is an existing path, otherwise from the store
fn load_workflow(reference: &str, db: &Database) -> Result<Workflow> {
    let path = Path::new(reference);
    if path.exists() {
        return import_workflow(path);
    }
    db.get_workflow(reference)?
        .ok_or_else(|| anyhow!("no workflow file or stored workflow '{}'", reference))
}

async fn run(args: RunArgs, mut config: EngineConfig, db: Arc<Database>) -> Result<()> {
    let workflow = load_workflow(&args.workflow, &db)?;

    let mut source = match &args.saved {
        Some(label) => {
            db.get_source(label)?
                .ok_or_else(|| anyhow!("no saved source '{}'", label))?
                .config
        }
        None if args.source.is_empty() => bail!("specify a source with --dir, --source or --saved"),
        None => args.source.to_config()?,
    };
    apply_env_credentials(&mut source);

    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if args.timeout.is_some() {
        config.image_timeout_secs = args.timeout;
    }

    let runner = WorkflowRunner::new(config, db);
    let id = runner.start(workflow, source, args.output).await?;
    log_info!("Execution {}", id);

    let record = follow(&runner, &id, args.verbose).await?;
    print_summary(&record);
    if let Some(path) = runner.log_path(&id) {
        log_info!("Log written to {}", path.display());
    }

    match record.status {
        ExecutionStatus::Failed => bail!(
            "execution failed: {}",
            record.error_message.as_deref().unwrap_or("unknown error")
        ),
        _ => Ok(()),
    }
}

/// Print events until the execution ends; Ctrl-C requests cancellation
async fn follow(runner: &WorkflowRunner, id: &Uuid, verbose: bool) -> Result<ExecutionRecord> {
    let mut rx = runner.subscribe(id).await?;
    let wait = runner.wait(id);
    tokio::pin!(wait);
    let mut cancel_sent = false;
    let mut closed = false;

    loop {
        tokio::select! {
            event = rx.recv(), if !closed => match event {
                Ok(event) => print_event(&event, verbose),
                Err(RecvError::Lagged(n)) => {
                    log_warning!("{} progress events dropped", n);
                }
                Err(RecvError::Closed) => closed = true,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                match runner.cancel(id).await {
                    CancelOutcome::Accepted => {
                        log_warning!("Cancelling after the images in progress...");
                    }
                    CancelOutcome::AlreadyTerminal => {
                        log_info!("Execution already finished");
                    }
                    CancelOutcome::NotFound => {
                        log_error!("Execution {} not found", id);
                    }
                }
            }
            record = &mut wait => {
                while let Ok(event) = rx.try_recv() {
                    print_event(&event, verbose);
                }
                return Ok(record?);
            }
        }
    }
}

fn print_event(event: &ProgressEvent, verbose: bool) {
    match event {
        ProgressEvent::ExecutionStarted {
            workflow_name,
            source_type,
            ..
        } => {
            log_info!("Running '{}' on {} source", workflow_name, source_type);
        }
        ProgressEvent::SourceOpened {
            total_hint: Some(n),
        } => {
            log_found!(n, "images");
        }
        ProgressEvent::SourceOpened { total_hint: None } => {
            log_info!("Source opened, image count unknown");
        }
        ProgressEvent::ImageStarted { index, name } => {
            if verbose {
                log_debug!("Started #{} {}", index, name);
            }
        }
        ProgressEvent::ImageSucceeded {
            output: Some(path), ..
        } => {
            log_file_saved!(path.display());
        }
        ProgressEvent::ImageSucceeded { name, .. } => {
            log_info!("{} done", name);
        }
        ProgressEvent::ImageSkipped { name, reason, .. } => {
            log_info!("Skipped {}: {}", name, reason);
        }
        ProgressEvent::ImageFailed { name, error, .. } => {
            log_error!("{}: {}", name, error);
        }
        ProgressEvent::Progress {
            processed, total, ..
        } => {
            log_progress!(processed, total, "images");
        }
        ProgressEvent::BatchStepStarted { action, .. } => {
            log_info!("Running batch step {}", action);
        }
        ProgressEvent::BatchStepCompleted { action, .. } => {
            log_info!("Batch step {} done", action);
        }
        ProgressEvent::BatchStepFailed { action, error, .. } => {
            log_error!("Batch step {} failed: {}", action, error);
        }
        ProgressEvent::CancelRequested { processed } => {
            log_warning!("Cancellation requested after {} images", processed);
        }
        ProgressEvent::ExecutionFinished { .. } => {}
        ProgressEvent::RecordPersistFailed { error } => {
            log_error!("Execution record could not be saved: {}", error);
        }
    }
}

fn print_summary(record: &ExecutionRecord) {
    println!();
    println!("Status:    {}", record.status);
    println!(
        "Images:    {} processed, {} succeeded, {} failed (of {})",
        record.processed_images, record.success_images, record.failed_images, record.total_images
    );
    println!("Output:    {}", record.output_directory.display());
    if let Some(duration) = record.duration() {
        println!("Duration:  {:.1}s", duration.num_milliseconds() as f64 / 1000.0);
    }
    if let Some(error) = &record.error_message {
        println!("Error:     {}", error);
    }
}

fn history(cmd: HistoryCommand, db: &Database) -> Result<()> {
    match cmd {
        HistoryCommand::List { limit, workflow } => {
            let records = db.list_executions(Some(limit), 0, workflow.as_deref())?;
            if records.is_empty() {
                log_info!("No executions recorded");
            }
            for r in records {
                println!(
                    "{}  {}  {:<10} {:<20} {}/{} ok, {} failed",
                    r.id,
                    r.start_time.format("%Y-%m-%d %H:%M:%S"),
                    r.status.to_string(),
                    r.workflow_name,
                    r.success_images,
                    r.processed_images,
                    r.failed_images
                );
            }
        }
        HistoryCommand::Show { id } => {
            let record = db
                .get(&id)?
                .ok_or_else(|| anyhow!("no execution {}", id))?;
            println!("Execution: {}", record.id);
            println!("Workflow:  {} ({})", record.workflow_name, record.workflow_id);
            println!("Source:    {} {}", record.source_type, serde_json::Value::Object(record.source_parameters.clone()));
            println!("Started:   {}", record.start_time.to_rfc3339());
            if let Some(end) = record.end_time {
                println!("Ended:     {}", end.to_rfc3339());
            }
            print_summary(&record);
            println!();
            for entry in &record.step_log {
                println!(
                    "{}  {:<9} {:<10} {}{}",
                    entry.timestamp.format("%H:%M:%S%.3f"),
                    entry.status.as_str(),
                    entry.action,
                    entry
                        .image
                        .as_ref()
                        .map(|img| format!("[{}] ", img))
                        .unwrap_or_default(),
                    entry.message
                );
            }
        }
        HistoryCommand::Delete { id } => {
            if db.delete(&id)? {
                log_info!("Deleted execution {}", id);
            } else {
                bail!("no execution {}", id);
            }
        }
        HistoryCommand::Prune { days } => {
            let removed = db.prune(chrono::Duration::days(days))?;
            log_info!("Removed {} execution record(s) older than {} days", removed, days);
        }
        HistoryCommand::Stats { workflow } => {
            let stats = db.stats(workflow.as_deref())?;
            println!("Total:     {}", stats.total);
            println!("Completed: {}", stats.completed);
            println!("Failed:    {}", stats.failed);
            println!("Cancelled: {}", stats.cancelled);
            println!("Running:   {}", stats.running);
        }
    }
    Ok(())
}

fn workflows(cmd: WorkflowCommand, db: &Database) -> Result<()> {
    match cmd {
        WorkflowCommand::Import { path } => {
            let workflow = import_workflow(&path)?;
            db.save_workflow(&workflow)?;
            log_info!("Stored workflow '{}' as {}", workflow.name, workflow.id);
        }
        WorkflowCommand::Export { id, path } => {
            let workflow = db
                .get_workflow(&id)?
                .ok_or_else(|| anyhow!("no stored workflow '{}'", id))?;
            export_workflow(&workflow, &path)?;
            log_file_saved!(path.display());
        }
        WorkflowCommand::List => {
            for workflow in db.list_workflows()? {
                println!(
                    "{}  {:<24} {} step(s)",
                    workflow.id,
                    workflow.name,
                    workflow.steps.len()
                );
            }
        }
        WorkflowCommand::Delete { id } => {
            if !db.delete_workflow(&id)? {
                bail!("no stored workflow '{}'", id);
            }
            log_info!("Deleted workflow {}", id);
        }
    }
    Ok(())
}

fn saved_sources(cmd: SourceCommand, db: &Database) -> Result<()> {
    match cmd {
        SourceCommand::Save { label, source } => {
            let saved = SavedSource::new(label, source.to_config()?);
            db.save_source(&saved)?;
            log_info!("Saved source '{}'", saved.label);
        }
        SourceCommand::List => {
            for saved in db.list_sources()? {
                println!(
                    "{:<16} {:<10} {}",
                    saved.label,
                    saved.config.source_type,
                    saved.tags().join(" ")
                );
            }
        }
        SourceCommand::Delete { label } => {
            if !db.delete_source(&label)? {
                bail!("no saved source '{}'", label);
            }
            log_info!("Deleted source '{}'", label);
        }
    }
    Ok(())
}
