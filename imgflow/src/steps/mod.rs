//! Built-in step actions

pub mod convert;
pub mod filter;
pub mod manifest;
pub mod resize;

use imgflow_sdk::{ImageHandle, StepAction, StepInput, StepOutcome};
use std::sync::Arc;

pub use convert::ConvertStep;
pub use filter::MinSizeStep;
pub use manifest::ManifestStep;
pub use resize::ResizeStep;

pub fn builtin_actions() -> Vec<Arc<dyn StepAction>> {
    vec![
        Arc::new(ResizeStep),
        Arc::new(ConvertStep),
        Arc::new(MinSizeStep),
        Arc::new(ManifestStep),
    ]
}

/// The single image of a per-image invocation
pub(crate) fn single_image<'a>(
    input: StepInput<'a>,
    action: &str,
) -> Result<&'a ImageHandle, StepOutcome> {
    match input {
        StepInput::Image(image) => Ok(image),
        StepInput::Batch(_) => Err(StepOutcome::failed(format!(
            "{} runs once per image, not on a batch",
            action
        ))),
    }
}

/// Run image work on the blocking pool
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, String>
where
    F: FnOnce() -> Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| format!("image task failed: {}", e))?
}

/// Drop a claimed output file after the step failed to fill it
pub(crate) async fn discard(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove unused artifact");
        }
    }
}

pub(crate) fn open_image(path: &std::path::Path) -> Result<image::DynamicImage, String> {
    image::open(path).map_err(|e| format!("cannot decode {}: {}", path.display(), e))
}
