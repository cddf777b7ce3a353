use image::imageops::FilterType;
use image::GenericImageView;
use imgflow_sdk::{
    async_trait, decode_params, ActionDefinition, ActionParams, ActionSchema, Artifact,
    Parameters, StepAction, StepInput, StepOutcome, WorkingContext,
};
use serde::Deserialize;

use super::{blocking, discard, open_image, single_image};

#[derive(Debug, Clone, Deserialize, ActionParams)]
#[action(
    id = "resize",
    name = "Resize",
    description = "Scale each image to a target size",
    category = "transform"
)]
pub struct ResizeParams {
    #[param(label = "Width", description = "Target width in pixels", min = "1")]
    pub width: u32,
    #[param(
        label = "Height",
        description = "Target height in pixels (default: keep aspect ratio)",
        min = "1"
    )]
    pub height: Option<u32>,
    #[param(
        label = "Mode",
        description = "fit: stay within the box, exact: stretch, fill: crop to fill",
        type = "select",
        options = "fit,exact,fill",
        default = "fit"
    )]
    pub mode: Option<String>,
}

pub struct ResizeStep;

/// Height that keeps the aspect ratio at `width`
fn proportional_height(orig_w: u32, orig_h: u32, width: u32) -> u32 {
    if orig_w == 0 {
        return orig_h.max(1);
    }
    ((orig_h as u64 * width as u64) / orig_w as u64).max(1) as u32
}

#[async_trait]
impl StepAction for ResizeStep {
    fn schema(&self) -> ActionSchema {
        ResizeParams::schema()
    }

    async fn apply(
        &self,
        input: StepInput<'_>,
        params: &Parameters,
        ctx: &WorkingContext,
    ) -> StepOutcome {
        let image = match single_image(input, "resize") {
            Ok(image) => image,
            Err(outcome) => return outcome,
        };
        let params: ResizeParams = match decode_params(params) {
            Ok(p) => p,
            Err(e) => return StepOutcome::failed(e),
        };

        let ext = image
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let target = match ctx.artifact_path(&format!("{}.{}", image.stem(), ext)) {
            Ok(path) => path,
            Err(e) => return StepOutcome::failed(format!("cannot prepare output: {}", e)),
        };
        let source = image.path.clone();
        let written = target.clone();

        let result = blocking(move || {
            let img = open_image(&source)?;
            let (orig_w, orig_h) = img.dimensions();
            let height = params
                .height
                .unwrap_or_else(|| proportional_height(orig_w, orig_h, params.width));

            let resized = match params.mode.as_deref().unwrap_or("fit") {
                "exact" => img.resize_exact(params.width, height, FilterType::Lanczos3),
                "fill" => img.resize_to_fill(params.width, height, FilterType::Lanczos3),
                _ => img.resize(params.width, height, FilterType::Lanczos3),
            };
            let (w, h) = resized.dimensions();
            resized
                .save(&written)
                .map_err(|e| format!("cannot write {}: {}", written.display(), e))?;
            Ok((w, h))
        })
        .await;

        match result {
            Ok((w, h)) => StepOutcome::Success(
                Artifact::file(target)
                    .with_meta("width", w)
                    .with_meta("height", h),
            ),
            Err(e) => {
                discard(&target).await;
                StepOutcome::failed(e)
            }
        }
    }
}
