use image::{DynamicImage, ImageFormat};
use imgflow_sdk::{
    async_trait, decode_params, ActionDefinition, ActionParams, ActionSchema, Artifact,
    Parameters, StepAction, StepInput, StepOutcome, WorkingContext,
};
use serde::Deserialize;

use super::{blocking, discard, open_image, single_image};

#[derive(Debug, Clone, Deserialize, ActionParams)]
#[action(
    id = "convert",
    name = "Convert",
    description = "Re-encode each image in another format or color mode",
    category = "transform"
)]
pub struct ConvertParams {
    #[param(
        label = "Format",
        type = "select",
        options = "png,jpeg,bmp,tiff,gif"
    )]
    pub format: String,
    #[param(
        label = "Color",
        description = "Color mode of the output (default: unchanged)",
        type = "select",
        options = "rgb,rgba,grayscale"
    )]
    pub color: Option<String>,
}

pub struct ConvertStep;

/// Image format and file extension for a `format` parameter value
fn output_format(format: &str) -> Option<(ImageFormat, &'static str)> {
    match format {
        "png" => Some((ImageFormat::Png, "png")),
        "jpeg" | "jpg" => Some((ImageFormat::Jpeg, "jpg")),
        "bmp" => Some((ImageFormat::Bmp, "bmp")),
        "tiff" => Some((ImageFormat::Tiff, "tiff")),
        "gif" => Some((ImageFormat::Gif, "gif")),
        _ => None,
    }
}

fn apply_color(img: DynamicImage, color: Option<&str>, format: ImageFormat) -> DynamicImage {
    let img = match color {
        Some("rgb") => DynamicImage::ImageRgb8(img.to_rgb8()),
        Some("rgba") => DynamicImage::ImageRgba8(img.to_rgba8()),
        Some("grayscale") => DynamicImage::ImageLuma8(img.to_luma8()),
        _ => img,
    };
    // JPEG has no alpha channel
    if format == ImageFormat::Jpeg && img.color().has_alpha() {
        DynamicImage::ImageRgb8(img.to_rgb8())
    } else {
        img
    }
}

#[async_trait]
impl StepAction for ConvertStep {
    fn schema(&self) -> ActionSchema {
        ConvertParams::schema()
    }

    async fn apply(
        &self,
        input: StepInput<'_>,
        params: &Parameters,
        ctx: &WorkingContext,
    ) -> StepOutcome {
        let image = match single_image(input, "convert") {
            Ok(image) => image,
            Err(outcome) => return outcome,
        };
        let params: ConvertParams = match decode_params(params) {
            Ok(p) => p,
            Err(e) => return StepOutcome::failed(e),
        };
        let Some((format, ext)) = output_format(&params.format) else {
            return StepOutcome::failed(format!("unsupported format '{}'", params.format));
        };

        let target = match ctx.artifact_path(&format!("{}.{}", image.stem(), ext)) {
            Ok(path) => path,
            Err(e) => return StepOutcome::failed(format!("cannot prepare output: {}", e)),
        };
        let source = image.path.clone();
        let written = target.clone();

        let result = blocking(move || {
            let img = open_image(&source)?;
            let img = apply_color(img, params.color.as_deref(), format);
            img.save_with_format(&written, format)
                .map_err(|e| format!("cannot write {}: {}", written.display(), e))
        })
        .await;

        match result {
            Ok(()) => StepOutcome::Success(Artifact::file(target).with_meta("format", ext)),
            Err(e) => {
                discard(&target).await;
                StepOutcome::failed(e)
            }
        }
    }
}
