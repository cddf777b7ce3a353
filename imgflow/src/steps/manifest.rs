use chrono::Utc;
use imgflow_sdk::{
    async_trait, decode_params, ActionDefinition, ActionParams, ActionSchema, Artifact,
    ImageHandle, Parameters, StepAction, StepInput, StepOutcome, WorkingContext,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::discard;

#[derive(Debug, Clone, Deserialize, ActionParams)]
#[action(
    id = "manifest",
    name = "Manifest",
    description = "Write a JSON manifest of the processed images",
    category = "output",
    scope = "batch"
)]
pub struct ManifestParams {
    #[param(label = "File name", default = "manifest.json")]
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    index: u64,
    name: &'a str,
    path: &'a PathBuf,
    meta: &'a Parameters,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    execution_id: Uuid,
    generated_at: String,
    count: usize,
    images: Vec<ManifestEntry<'a>>,
}

pub struct ManifestStep;

#[async_trait]
impl StepAction for ManifestStep {
    fn schema(&self) -> ActionSchema {
        ManifestParams::schema()
    }

    async fn apply(
        &self,
        input: StepInput<'_>,
        params: &Parameters,
        ctx: &WorkingContext,
    ) -> StepOutcome {
        let StepInput::Batch(images) = input else {
            return StepOutcome::failed("manifest runs once on the whole batch");
        };
        let params: ManifestParams = match decode_params(params) {
            Ok(p) => p,
            Err(e) => return StepOutcome::failed(e),
        };
        let file_name = params
            .file_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "manifest.json".to_string());

        let mut sorted: Vec<&ImageHandle> = images.iter().collect();
        sorted.sort_by_key(|img| img.index);
        let manifest = Manifest {
            execution_id: ctx.execution_id,
            generated_at: Utc::now().to_rfc3339(),
            count: sorted.len(),
            images: sorted
                .iter()
                .map(|img| ManifestEntry {
                    index: img.index,
                    name: &img.name,
                    path: &img.path,
                    meta: &img.meta,
                })
                .collect(),
        };

        let content = match serde_json::to_string_pretty(&manifest) {
            Ok(c) => c,
            Err(e) => return StepOutcome::failed(format!("cannot serialize manifest: {}", e)),
        };
        let target = match ctx.artifact_path(&file_name) {
            Ok(path) => path,
            Err(e) => return StepOutcome::failed(format!("cannot prepare output: {}", e)),
        };
        if let Err(e) = tokio::fs::write(&target, content).await {
            discard(&target).await;
            return StepOutcome::failed(format!("cannot write {}: {}", target.display(), e));
        }

        StepOutcome::Success(Artifact::file(target).with_meta("count", sorted.len()))
    }
}
