use super::common::*;
use futures::stream::{self, StreamExt};
use imgflow::config::ProviderSettings;
use imgflow::{ExecutionRecorder, WorkflowRunner};
use imgflow_sdk::{
    async_trait, EngineError, ExecutionStatus, ImageHandle, ItemFetchError, LogStatus,
    OpenedSource, Parameters, ProgressEvent, SourceConfig, SourceContext, SourceDescriptor,
    SourceError, SourceKind, SourceProvider, Step, Workflow, WorkflowRuntime, SOURCE_STEP,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

fn convert_workflow() -> Workflow {
    let mut workflow = Workflow::new("to-bmp", "");
    workflow.add_step(Step::with_json("convert", json!({"format": "bmp"})));
    workflow
}

#[tokio::test]
async fn test_missing_directory_fails_the_execution() {
    let env = TestEnv::new();
    let runner = env.runner();
    let missing = env.dir.path().join("nowhere");

    let err = runner
        .start(convert_workflow(), SourceConfig::local(&missing), None)
        .await
        .unwrap_err();
    let execution_id = match err {
        EngineError::Source {
            execution_id,
            source: SourceError::MissingDirectory(path),
            ..
        } => {
            assert_eq!(path, missing);
            execution_id
        }
        other => panic!("unexpected error: {other:?}"),
    };

    let record = runner.status(&execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.processed_images, 0);
    assert!(record.error_message.unwrap().contains("source failed"));
    let last = record.step_log.last().unwrap();
    assert_eq!(last.step_id, SOURCE_STEP);
    assert_eq!(last.status, LogStatus::Failed);

    let stored = env.db.get(&execution_id).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert!(runner.active_execution().is_none());
}

#[tokio::test]
async fn test_recursive_local_source() {
    let env = TestEnv::new();
    write_png(&env.input, "top.png", 8, 8);
    write_png(&env.input.join("nested").join("deeper"), "inner.png", 8, 8);
    std::fs::write(env.input.join("notes.txt"), "not an image").unwrap();
    let runner = env.runner();

    let mut source = SourceConfig::local(&env.input);
    source
        .parameters
        .insert("recursive".to_string(), json!(true));

    let id = runner.start(convert_workflow(), source, None).await.unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.total_images, 2);
    assert_eq!(record.success_images, 2);
    assert!(env.output.join("top.bmp").exists());
    assert!(env.output.join("inner.bmp").exists());
}

#[tokio::test]
async fn test_unreachable_remote_fails_fast() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.sources.insert(
        "danbooru".to_string(),
        ProviderSettings::with_base_url("http://127.0.0.1:9"),
    );
    let runner = WorkflowRunner::new(config, env.db.clone());

    let err = runner
        .start(
            convert_workflow(),
            SourceConfig::remote("danbooru", ["cat"], Some(3)),
            None,
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Source {
            source_type,
            source: SourceError::Unreachable(_),
            execution_id,
        } => {
            assert_eq!(source_type, "danbooru");
            let record = env.db.get(&execution_id).unwrap().unwrap();
            assert_eq!(record.status, ExecutionStatus::Failed);
            assert_eq!(record.source_parameters["tags"], json!(["cat"]));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_updated_provider_settings_reach_the_next_execution() {
    let env = TestEnv::new();
    let mut config = env.config();
    config
        .sources
        .insert("danbooru".to_string(), ProviderSettings::with_base_url(""));
    let runner = WorkflowRunner::new(config.clone(), env.db.clone());

    config.sources.insert(
        "danbooru".to_string(),
        ProviderSettings::with_base_url("http://127.0.0.1:9"),
    );
    runner.update_config(config);

    let err = runner
        .start(
            convert_workflow(),
            SourceConfig::remote("danbooru", ["cat"], Some(3)),
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::Source {
                source: SourceError::Unreachable(_),
                ..
            }
        ),
        "{err}"
    );
}

/// Known-size source whose second item cannot be fetched
struct PartialSource {
    images: Vec<PathBuf>,
}

#[async_trait]
impl SourceProvider for PartialSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            id: "partial".to_string(),
            name: "Partial".to_string(),
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
        let items = vec![
            Ok(ImageHandle::new(0, self.images[0].clone())),
            Err(ItemFetchError::new("post 42", "connection reset")),
            Ok(ImageHandle::new(2, self.images[1].clone())),
        ];
        Ok(OpenedSource {
            images: stream::iter(items).boxed(),
            total_hint: Some(3),
        })
    }
}

#[tokio::test]
async fn test_fetch_errors_report_their_own_position() {
    let env = TestEnv::new();
    let images = vec![
        write_png(&env.input, "first.png", 8, 8),
        write_png(&env.input, "third.png", 8, 8),
    ];
    let provider: Arc<dyn SourceProvider> = Arc::new(PartialSource { images });
    let runner = env.runner_with(env.config(), env.db.clone(), vec![provider]);

    let id = runner
        .start(
            convert_workflow(),
            SourceConfig::new("partial", Parameters::new()),
            None,
        )
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();
    assert_eq!(record.total_images, 3);
    assert_eq!(record.success_images, 2);
    assert_eq!(record.failed_images, 1);

    let failed: Vec<(u64, String)> = runner
        .events(&id, None)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::ImageFailed { index, name, .. } => Some((index, name)),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![(1, "post 42".to_string())]);
}
