use super::common::*;
use imgflow::ExecutionRecorder;
use imgflow_sdk::{
    CancelOutcome, EngineError, ExecutionStatus, LogStatus, Parameters, SourceConfig, Step,
    Workflow, WorkflowRuntime,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

fn resize_workflow() -> Workflow {
    let mut workflow = Workflow::new("thumbnails", "Shrink everything");
    workflow.add_step(Step::with_json("resize", json!({"width": 8})));
    workflow
}

fn gated_config() -> SourceConfig {
    SourceConfig::new("gated", Parameters::new())
}

#[tokio::test]
async fn test_corrupt_image_is_isolated() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 32, 16);
    write_corrupt(&env.input, "b.png");
    write_png(&env.input, "c.png", 32, 16);
    let runner = env.runner();

    let id = runner
        .start(resize_workflow(), SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.total_images, 3);
    assert_eq!(record.processed_images, 3);
    assert_eq!(record.success_images, 2);
    assert_eq!(record.failed_images, 1);
    assert!(record.error_message.is_none());
    assert!(record.end_time.is_some());

    let failures: Vec<_> = record.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].image.as_deref(), Some("b.png"));
    assert_eq!(failures[0].action, "resize");

    assert!(env.output.join("a.png").exists());
    assert!(env.output.join("c.png").exists());
    assert!(!env.output.join("b.png").exists());

    // processed == success + failed at every published point, never decreasing
    let progress = progress_events(&runner, &id).await;
    assert_eq!(progress.len(), 3);
    let mut last = 0;
    for (processed, success, failed) in progress {
        assert_eq!(processed, success + failed);
        assert!(processed >= last);
        last = processed;
    }
}

#[tokio::test]
async fn test_execution_log_file_is_written() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 32, 16);
    write_corrupt(&env.input, "b.png");
    let runner = env.runner();

    let id = runner
        .start(resize_workflow(), SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    runner.wait(&id).await.unwrap();

    let path = env.dir.path().join("logs").join(format!("{}_log.txt", id));
    assert_eq!(runner.log_path(&id), Some(path.clone()));
    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.contains("running workflow 'thumbnails' on local source"), "{log}");
    assert!(log.contains("ERROR - image #1 b.png failed"), "{log}");
    assert!(log
        .lines()
        .last()
        .unwrap()
        .contains("execution completed: 2 processed, 1 ok, 1 failed"));
}

#[tokio::test]
async fn test_batch_step_failure_fails_execution() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 20, 20);
    write_png(&env.input, "b.png", 20, 20);
    let runner = env.runner_with(env.config(), env.db.clone(), Vec::new());

    let mut workflow = resize_workflow();
    workflow.add_step(Step::with_json("failing_batch", json!({})));

    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.success_images, 2);
    assert_eq!(record.failed_images, 0);
    let error = record.error_message.unwrap();
    assert!(error.contains("failing_batch"), "{}", error);
    assert!(record
        .step_log
        .iter()
        .any(|e| e.action == "failing_batch" && e.status == LogStatus::Failed));
}

#[tokio::test]
async fn test_remote_source_without_tags_is_rejected() {
    let env = TestEnv::new();
    let runner = env.runner();
    let source = SourceConfig::remote("danbooru", Vec::<String>::new(), Some(10));

    let err = runner
        .start(resize_workflow(), source, None)
        .await
        .unwrap_err();
    let problems = expect_config_error(err);
    assert!(problems.iter().any(|p| p.contains("tags")), "{:?}", problems);

    assert!(env.db.list().unwrap().is_empty());
    assert!(runner.active_execution().is_none());
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let env = TestEnv::new();
    let gated = Arc::new(GatedSource::new(vec![write_png(&env.input, "a.png", 16, 16)]));
    let runner = env.gated_runner(&gated);

    let first = runner
        .start(resize_workflow(), gated_config(), None)
        .await
        .unwrap();
    let err = runner
        .start(resize_workflow(), SourceConfig::local(&env.input), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunnerBusy(id) if id == first));

    gated.release(1);
    let record = runner.wait(&first).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.success_images, 1);

    // The runner is free again
    let second = runner
        .start(resize_workflow(), SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    assert_ne!(first, second);
    runner.wait(&second).await.unwrap();
}

#[tokio::test]
async fn test_cancel_before_any_image() {
    let env = TestEnv::new();
    let images = (0..3)
        .map(|i| write_png(&env.input, &format!("{}.png", i), 8, 8))
        .collect();
    let gated = Arc::new(GatedSource::new(images));
    let runner = env.gated_runner(&gated);

    let id = runner
        .start(resize_workflow(), gated_config(), None)
        .await
        .unwrap();
    assert_eq!(runner.cancel(&id).await, CancelOutcome::Accepted);
    gated.release(3);

    let record = runner.wait(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.processed_images, 0);
    assert!(record.end_time.is_some());
    assert!(record.error_message.is_none());

    assert_eq!(runner.cancel(&id).await, CancelOutcome::AlreadyTerminal);
    assert_eq!(runner.cancel(&Uuid::new_v4()).await, CancelOutcome::NotFound);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_completed_work() {
    let env = TestEnv::new();
    let images = (0..5)
        .map(|i| write_png(&env.input, &format!("{}.png", i), 8, 8))
        .collect();
    let gated = Arc::new(GatedSource::new(images));
    let runner = env.gated_runner(&gated);

    let id = runner
        .start(resize_workflow(), gated_config(), None)
        .await
        .unwrap();
    gated.release(2);
    let before = wait_until(&runner, &id, |r| r.processed_images == 2).await;

    assert_eq!(runner.cancel(&id).await, CancelOutcome::Accepted);
    gated.release(3);
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert!(record.processed_images >= before.processed_images);
    assert_eq!(record.processed_images, 2);
    assert_eq!(record.total_images, 5);

    let progress = progress_events(&runner, &id).await;
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));

    let stored = env.db.get(&id).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert_eq!(stored.processed_images, 2);
}

#[tokio::test]
async fn test_filter_and_manifest() {
    let env = TestEnv::new();
    write_png(&env.input, "big.png", 40, 40);
    write_png(&env.input, "small.png", 5, 5);
    let runner = env.runner();

    let mut workflow = Workflow::new("catalogue", "");
    workflow.add_step(Step::with_json("min_size", json!({"min_width": 10})));
    workflow.add_step(Step::with_json("resize", json!({"width": 8})));
    workflow.add_step(Step::with_json("manifest", json!({})));

    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.processed_images, 2);
    assert_eq!(record.success_images, 2);
    assert_eq!(record.failed_images, 0);
    let skipped: Vec<_> = record
        .step_log
        .iter()
        .filter(|e| e.status == LogStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].image.as_deref(), Some("small.png"));

    assert_eq!(image::image_dimensions(env.output.join("big.png")).unwrap(), (8, 8));
    assert!(!env.output.join("small.png").exists());
    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(env.output.join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["count"], 1);
    assert_eq!(manifest["execution_id"], json!(id));
}

#[tokio::test]
async fn test_step_summaries_count_images_that_passed() {
    let env = TestEnv::new();
    write_png(&env.input, "big.png", 40, 40);
    write_png(&env.input, "small.png", 5, 5);
    write_corrupt(&env.input, "broken.png");
    let runner = env.runner();

    let mut workflow = Workflow::new("sorted", "");
    workflow.add_step(Step::with_json("convert", json!({"format": "png"})));
    workflow.add_step(Step::with_json("min_size", json!({"min_width": 10})));

    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();
    assert_eq!(record.success_images, 2);
    assert_eq!(record.failed_images, 1);

    let summary = |action: &str| {
        record
            .step_log
            .iter()
            .find(|e| e.action == action && e.status == LogStatus::Completed && e.image.is_none())
            .map(|e| e.message.clone())
            .unwrap()
    };
    // broken.png fails in convert, small.png is filtered out by min_size
    assert_eq!(summary("convert"), "2 image(s) passed");
    assert_eq!(summary("min_size"), "1 image(s) passed");
}

#[tokio::test]
async fn test_worker_pool_runs_images_concurrently() {
    let env = TestEnv::new();
    for i in 0..3 {
        write_png(&env.input, &format!("{}.png", i), 8, 8);
    }
    let mut config = env.config();
    config.max_workers = 3;
    let runner = env.runner_with(config, env.db.clone(), Vec::new());

    let mut workflow = Workflow::new("slow", "");
    workflow.add_step(Step::with_json("slow", json!({})));

    let started = Instant::now();
    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.success_images, 3);
    assert!(started.elapsed().as_millis() < (SLOW_STEP_MS * 3) as u128);
    // Unchanged images are still copied to the output
    for i in 0..3 {
        assert!(env.output.join(format!("{}.png", i)).exists());
    }
}

fn write_bmp(dir: &std::path::Path, name: &str, w: u32, h: u32) {
    image::RgbImage::from_pixel(w, h, image::Rgb([5, 6, 7]))
        .save(dir.join(name))
        .unwrap();
}

fn output_dimensions(dir: &std::path::Path) -> Vec<(u32, u32)> {
    let mut dims: Vec<(u32, u32)> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| image::image_dimensions(entry.unwrap().path()).unwrap())
        .collect();
    dims.sort();
    dims
}

#[tokio::test]
async fn test_same_stem_images_keep_separate_outputs() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 600, 300);
    write_bmp(&env.input, "a.bmp", 300, 600);
    let mut config = env.config();
    config.max_workers = 2;
    let runner = env.runner_with(config, env.db.clone(), Vec::new());

    let mut workflow = Workflow::new("to-tiff", "");
    workflow.add_step(Step::with_json("convert", json!({"format": "tiff"})));

    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.success_images, 2);
    assert_eq!(output_dimensions(&env.output), vec![(300, 600), (600, 300)]);
}

#[tokio::test]
async fn test_same_stem_intermediates_do_not_collide() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 600, 300);
    write_bmp(&env.input, "a.bmp", 300, 600);
    let mut config = env.config();
    config.max_workers = 2;
    let runner = env.runner_with(config, env.db.clone(), Vec::new());

    // Both images pass through the same scratch folder as a.png before being copied out
    let mut workflow = Workflow::new("png-then-filter", "");
    workflow.add_step(Step::with_json("convert", json!({"format": "png"})));
    workflow.add_step(Step::with_json("min_size", json!({"min_width": 1})));

    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.success_images, 2);
    assert_eq!(output_dimensions(&env.output), vec![(300, 600), (600, 300)]);
}

#[tokio::test]
async fn test_image_timeout_fails_only_that_image() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 8, 8);
    let mut config = env.config();
    config.image_timeout_secs = Some(1);
    let runner = env.runner_with(config, env.db.clone(), Vec::new());

    let mut workflow = Workflow::new("slow", "");
    workflow.add_step(Step::with_json("slow", json!({})));

    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.failed_images, 1);
    let failure = record.failures().next().unwrap();
    assert!(failure.message.contains("timed out"), "{}", failure.message);
}

#[tokio::test]
async fn test_step_panic_is_an_image_failure() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 8, 8);
    write_png(&env.input, "b.png", 8, 8);
    let runner = env.runner_with(env.config(), env.db.clone(), Vec::new());

    let mut workflow = Workflow::new("fragile", "");
    workflow.add_step(Step::with_json("panic", json!({})));

    let id = runner
        .start(workflow, SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.success_images, 1);
    assert_eq!(record.failed_images, 1);
    let failure = record.failures().next().unwrap();
    assert_eq!(failure.image.as_deref(), Some("b.png"));
    assert!(failure.message.contains("step panicked"));
}

#[tokio::test]
async fn test_validate_reports_every_problem() {
    let env = TestEnv::new();
    let runner = env.runner();

    let mut workflow = Workflow::new("broken", "");
    workflow.add_step(Step::with_json("sharpen", json!({})));
    workflow.add_step(Step::with_json("resize", json!({"mode": "zoom"})));

    let err = runner
        .validate(&workflow, &SourceConfig::local(&env.input))
        .unwrap_err();
    let problems = expect_config_error(err);
    assert!(problems.iter().any(|p| p.contains("unknown action 'sharpen'")));
    assert!(problems.iter().any(|p| p.contains("'width'")));
    assert!(problems.iter().any(|p| p.contains("'mode'")));
}
