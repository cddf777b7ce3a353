use imgflow_sdk::{
    async_trait, decode_params, ActionDefinition, ActionParams, ActionSchema, Artifact,
    Parameters, StepAction, StepInput, StepOutcome, WorkingContext,
};
use serde::Deserialize;

use super::{blocking, single_image};

#[derive(Debug, Clone, Deserialize, ActionParams)]
#[action(
    id = "min_size",
    name = "Minimum size",
    description = "Skip images smaller than the given dimensions",
    category = "filter"
)]
pub struct MinSizeParams {
    #[param(label = "Minimum width", min = "0")]
    pub min_width: Option<u32>,
    #[param(label = "Minimum height", min = "0")]
    pub min_height: Option<u32>,
}

pub struct MinSizeStep;

#[async_trait]
impl StepAction for MinSizeStep {
    fn schema(&self) -> ActionSchema {
        MinSizeParams::schema()
    }

    async fn apply(
        &self,
        input: StepInput<'_>,
        params: &Parameters,
        _ctx: &WorkingContext,
    ) -> StepOutcome {
        let image = match single_image(input, "min_size") {
            Ok(image) => image,
            Err(outcome) => return outcome,
        };
        let params: MinSizeParams = match decode_params(params) {
            Ok(p) => p,
            Err(e) => return StepOutcome::failed(e),
        };

        // Only the header is read
        let path = image.path.clone();
        let dimensions = blocking(move || {
            image::image_dimensions(&path)
                .map_err(|e| format!("cannot read {}: {}", path.display(), e))
        })
        .await;
        let (w, h) = match dimensions {
            Ok(dims) => dims,
            Err(e) => return StepOutcome::failed(e),
        };

        let min_w = params.min_width.unwrap_or(0);
        let min_h = params.min_height.unwrap_or(0);
        if w < min_w || h < min_h {
            return StepOutcome::skipped(format!(
                "{}x{} is below the minimum {}x{}",
                w, h, min_w, min_h
            ));
        }

        StepOutcome::Success(
            Artifact::unchanged()
                .with_meta("width", w)
                .with_meta("height", h),
        )
    }
}
