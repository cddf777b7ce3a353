use super::common::*;
use chrono::{Duration as ChronoDuration, Utc};
use imgflow::ExecutionRecorder;
use imgflow_sdk::{
    CancelOutcome, EngineError, ExecutionRecord, ExecutionStatus, ProgressEvent, SourceConfig,
    Step, Workflow, WorkflowRuntime,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn convert_workflow() -> Workflow {
    let mut workflow = Workflow::new("to-bmp", "");
    workflow.add_step(Step::with_json("convert", json!({"format": "bmp"})));
    workflow
}

fn finished_record(age: ChronoDuration, output: &std::path::Path) -> ExecutionRecord {
    let mut record = ExecutionRecord::start(
        Uuid::new_v4(),
        &convert_workflow(),
        &SourceConfig::local("/photos"),
        output.to_path_buf(),
    );
    record.start_time = Utc::now() - age;
    record.finalize(ExecutionStatus::Completed, None);
    record
}

#[test]
fn test_prune_removes_only_old_records() {
    let env = TestEnv::new();
    let old = finished_record(ChronoDuration::days(30), &env.output);
    let older = finished_record(ChronoDuration::days(10), &env.output);
    let recent = finished_record(ChronoDuration::hours(1), &env.output);
    for record in [&old, &older, &recent] {
        env.db.save(record).unwrap();
    }

    assert_eq!(env.db.prune(ChronoDuration::days(7)).unwrap(), 2);

    let remaining = env.db.list().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, recent.id);
    assert_eq!(env.db.prune(ChronoDuration::days(7)).unwrap(), 0);
}

#[tokio::test]
async fn test_unrecordable_start_is_rejected() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 8, 8);
    let recorder = Arc::new(FlakyRecorder::failing_from(0));
    let runner = env.runner_with(env.config(), recorder.clone(), Vec::new());

    let err = runner
        .start(convert_workflow(), SourceConfig::local(&env.input), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Recorder(_)), "{err}");
    assert!(runner.active_execution().is_none());
    assert!(recorder.list().unwrap().is_empty());
    assert!(!env.output.join("a.bmp").exists());
}

#[tokio::test]
async fn test_lost_final_save_is_reported() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 8, 8);
    let recorder = Arc::new(FlakyRecorder::failing_from(1));
    let runner = env.runner_with(env.config(), recorder.clone(), Vec::new());

    let id = runner
        .start(convert_workflow(), SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let record = runner.wait(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.success_images, 1);

    let events = runner.events(&id, None).await.unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::RecordPersistFailed { .. })));

    // Only the initial save made it
    let stored = recorder.inner.get(&id).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.processed_images, 0);
}

#[tokio::test]
async fn test_terminal_status_is_visible_while_the_final_save_retries() {
    let env = TestEnv::new();
    let gated = Arc::new(GatedSource::new(vec![write_png(&env.input, "a.png", 8, 8)]));
    let recorder = Arc::new(FlakyRecorder::failing_from(1));
    let mut config = env.config();
    config.checkpoint_interval = 0;
    config.recorder_retries = 2;
    config.recorder_retry_delay_ms = 300;
    let provider: Arc<dyn imgflow_sdk::SourceProvider> = gated.clone();
    let runner = env.runner_with(config, recorder.clone(), vec![provider]);

    let id = runner
        .start(convert_workflow(), SourceConfig::new("gated", Default::default()), None)
        .await
        .unwrap();
    gated.release(1);

    let record = wait_until(&runner, &id, |r| r.is_terminal()).await;
    assert_eq!(record.status, ExecutionStatus::Completed);

    // The final save is still backing off, yet the execution no longer accepts a cancel
    assert_eq!(runner.cancel(&id).await, CancelOutcome::AlreadyTerminal);
    let events = runner.events(&id, None).await.unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e, ProgressEvent::ExecutionFinished { .. })));

    let record = runner.wait(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.success_images, 1);
}

#[tokio::test]
async fn test_checkpoints_reach_the_recorder_while_running() {
    let env = TestEnv::new();
    let images = (0..3)
        .map(|i| write_png(&env.input, &format!("{}.png", i), 8, 8))
        .collect();
    let gated = Arc::new(GatedSource::new(images));
    let mut config = env.config();
    config.checkpoint_interval = 1;
    let provider: Arc<dyn imgflow_sdk::SourceProvider> = gated.clone();
    let runner = env.runner_with(config, env.db.clone(), vec![provider]);

    let id = runner
        .start(convert_workflow(), SourceConfig::new("gated", Default::default()), None)
        .await
        .unwrap();
    gated.release(1);

    let mut checkpointed = None;
    for _ in 0..500 {
        let stored = env.db.get(&id).unwrap().unwrap();
        if stored.processed_images == 1 {
            checkpointed = Some(stored);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let checkpointed = checkpointed.expect("checkpoint was never saved");
    assert_eq!(checkpointed.status, ExecutionStatus::Running);
    assert_eq!(checkpointed.total_images, 3);
    assert!(checkpointed.end_time.is_none());

    gated.release(2);
    let record = runner.wait(&id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    let stored = env.db.get(&id).unwrap().unwrap();
    assert_eq!(stored.processed_images, 3);
    assert_eq!(stored.step_log.len(), record.step_log.len());
}

#[tokio::test]
async fn test_history_outlives_the_runner_state() {
    let env = TestEnv::new();
    write_png(&env.input, "a.png", 8, 8);
    let runner = env.runner();

    let id = runner
        .start(convert_workflow(), SourceConfig::local(&env.input), None)
        .await
        .unwrap();
    let finished = runner.wait(&id).await.unwrap();
    runner.cleanup_completed_executions();

    let reloaded = runner.status(&id).await.unwrap();
    assert_eq!(reloaded.status, finished.status);
    assert_eq!(reloaded.success_images, finished.success_images);
    assert_eq!(reloaded.step_log.len(), finished.step_log.len());
    assert!(matches!(
        runner.events(&id, None).await,
        Err(EngineError::NotFound(_))
    ));

    // Deleting history leaves the produced files alone
    assert!(env.db.delete(&id).unwrap());
    assert!(env.db.get(&id).unwrap().is_none());
    assert!(env.output.join("a.bmp").exists());
    assert!(matches!(
        runner.status(&id).await,
        Err(EngineError::NotFound(_))
    ));
}
