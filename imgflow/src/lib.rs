// Progress/log bus
pub mod bus;

// Command-line interface
pub mod cli;

// Engine configuration
pub mod config;

// SQLite-backed stores
pub mod database;

// Per-execution image pipeline
mod pipeline;

// Execution recorder contract
pub mod recorder;

// Action and source registries
pub mod registry;

// Workflow runner
pub mod runtime;

// Built-in sources and steps
pub mod sources;
pub mod steps;

pub mod utils;

pub use bus::ProgressBus;
pub use config::EngineConfig;
pub use database::{Database, ExecutionStats};
pub use recorder::{ExecutionRecorder, RecorderError};
pub use registry::{ActionRegistry, ResolvedStep, SourceRegistry};
pub use runtime::WorkflowRunner;
