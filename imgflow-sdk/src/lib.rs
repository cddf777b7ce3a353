// Lets the derive's `imgflow_sdk::` paths resolve inside this crate too
extern crate self as imgflow_sdk;

// Re-export the derive macro
pub use imgflow_macros::ActionParams;

// Re-exported for the derive macro and for step/source implementations
pub use async_trait::async_trait;
pub use serde_json;

pub mod error;
pub mod event;
pub mod model;
pub mod record;
pub mod runtime;
pub mod schema;
pub mod source;
pub mod step;

pub use error::{EngineError, SourceError, WorkflowEditError};
pub use event::ProgressEvent;
pub use model::{SavedSource, SourceConfig, Step, Workflow, LOCAL_SOURCE};
pub use record::{ExecutionRecord, ExecutionStatus, LogStatus, StepLogEntry, SOURCE_STEP};
pub use runtime::{CancelOutcome, WorkflowRuntime};
pub use schema::{
    is_empty_value, validate_parameters, ActionDefinition, ActionMetadata, ActionSchema,
    ParamSchema, ParamType, Parameters, StepScope,
};
pub use source::{
    tag_list, ImageStream, ItemFetchError, OpenedSource, SourceContext, SourceDescriptor,
    SourceKind, SourceProvider,
};
pub use step::{
    claim_unique_path, decode_params, Artifact, ImageHandle, StepAction, StepInput, StepOutcome,
    WorkingContext,
};

// ============================================================================
// Console Logging Macros (for the CLI)
// ============================================================================
// Coloured one-liners for humans. Operator diagnostics go through `tracing`,
// subscribers get typed `ProgressEvent`s.
// ============================================================================

/// Logs an informational message.
///
/// # Example
/// ```
/// use imgflow_sdk::log_info;
/// log_info!("Opening source...");
/// ```
///
/// Outputs:
/// ```text
/// ℹ Opening source...
/// ```
#[macro_export]
macro_rules! log_info {
    ($message:expr) => {
        println!("\x1b[36mℹ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[36mℹ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a warning message.
///
/// # Example
/// ```
/// use imgflow_sdk::log_warning;
/// log_warning!("cat_02.png: cannot decode image");
/// ```
///
/// Outputs:
/// ```text
/// ⚠ Warning: cat_02.png: cannot decode image
/// ```
#[macro_export]
macro_rules! log_warning {
    ($message:expr) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs an error message.
///
/// # Example
/// ```
/// use imgflow_sdk::log_error;
/// log_error!("manifest step failed");
/// ```
///
/// Outputs:
/// ```text
/// ✗ manifest step failed
/// ```
#[macro_export]
macro_rules! log_error {
    ($message:expr) => {
        println!("\x1b[31m✗ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[31m✗ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs progress of an operation.
///
/// # Example
/// ```
/// use imgflow_sdk::log_progress;
/// log_progress!(3, 5, "images");
/// ```
///
/// Outputs:
/// ```text
/// Progress: 3/5 images
/// ```
#[macro_export]
macro_rules! log_progress {
    ($current:expr, $total:expr, $item_type:expr) => {
        println!(
            "\x1b[36mProgress: {}/{} {}\x1b[0m",
            $current, $total, $item_type
        );
    };
}

/// Logs the number of items found.
///
/// # Example
/// ```
/// use imgflow_sdk::log_found;
/// log_found!(14, "images");
/// ```
///
/// Outputs:
/// ```text
/// Found 14 images
/// ```
#[macro_export]
macro_rules! log_found {
    ($count:expr, $item_type:expr) => {
        println!("\x1b[36mFound {} {}\x1b[0m", $count, $item_type);
    };
}

/// Logs that a file has been saved.
///
/// # Example
/// ```
/// use imgflow_sdk::log_file_saved;
/// log_file_saved!("./out/cat.png");
/// ```
///
/// Outputs:
/// ```text
/// ✓ Saved: ./out/cat.png
/// ```
#[macro_export]
macro_rules! log_file_saved {
    ($path:expr) => {
        println!("\x1b[32m✓ Saved: {}\x1b[0m", $path);
    };
}

/// Logs a debug message (intended to be used conditionally).
///
/// # Example
/// ```
/// use imgflow_sdk::log_debug;
/// let count = 42;
/// log_debug!("Pulled {} items", count);
/// ```
///
/// Outputs:
/// ```text
/// [DEBUG] Pulled 42 items
/// ```
#[macro_export]
macro_rules! log_debug {
    ($message:expr) => {
        println!("\x1b[2m[DEBUG] {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[2m[DEBUG] {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

// ============================================================================
// End of Console Logging Macros
// ============================================================================
