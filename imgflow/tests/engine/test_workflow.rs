use super::common::*;
use imgflow::utils::{export_workflow, import_workflow};
use imgflow_sdk::{SavedSource, SourceConfig, Step, Workflow, WorkflowEditError};
use serde_json::json;

fn sample() -> Workflow {
    let mut workflow = Workflow::new("web export", "Shrink and convert for the gallery");
    workflow.add_step(Step::with_json("min_size", json!({"min_width": 64})));
    workflow.add_step(Step::with_json("resize", json!({"width": 512, "mode": "fit"})));
    workflow.add_step(Step::with_json("convert", json!({"format": "jpeg"})));
    workflow.add_step(Step::with_json("manifest", json!({})));
    workflow
}

fn step_ids(workflow: &Workflow) -> Vec<String> {
    workflow.steps.iter().map(|s| s.id.clone()).collect()
}

#[test]
fn test_json_and_yaml_files_describe_the_same_workflow() {
    let env = TestEnv::new();
    let workflow = sample();
    let json_path = env.dir.path().join("flows").join("web.json");
    let yaml_path = env.dir.path().join("flows").join("web.yaml");

    export_workflow(&workflow, &json_path).unwrap();
    export_workflow(&workflow, &yaml_path).unwrap();

    let from_json = import_workflow(&json_path).unwrap();
    let from_yaml = import_workflow(&yaml_path).unwrap();
    assert_eq!(from_json, workflow);
    assert_eq!(from_yaml, workflow);
}

#[test]
fn test_hand_written_yaml_gets_step_ids() {
    let env = TestEnv::new();
    let path = env.dir.path().join("quick.yml");
    std::fs::write(
        &path,
        "name: quick\nsteps:\n  - action: resize\n    parameters:\n      width: 100\n  - action: convert\n    parameters:\n      format: png\n",
    )
    .unwrap();

    let workflow = import_workflow(&path).unwrap();
    assert_eq!(workflow.steps.len(), 2);
    assert_ne!(workflow.steps[0].id, workflow.steps[1].id);
    assert_eq!(workflow.steps[1].action, "convert");
}

#[test]
fn test_unsupported_extension_is_rejected() {
    let env = TestEnv::new();
    let path = env.dir.path().join("flow.toml");
    assert!(export_workflow(&sample(), &path).is_err());
    assert!(!path.exists());
}

#[test]
fn test_editing_keeps_step_identity() {
    let mut workflow = sample();
    let original = step_ids(&workflow);

    workflow.move_step(&original[3], 0).unwrap();
    assert_eq!(
        step_ids(&workflow),
        vec![
            original[3].clone(),
            original[0].clone(),
            original[1].clone(),
            original[2].clone()
        ]
    );

    let before = workflow.clone();
    let bad_order = vec![original[0].clone(), original[1].clone(), "nope".to_string()];
    match workflow.reorder(&bad_order) {
        Err(WorkflowEditError::ReorderMismatch { missing, unknown }) => {
            assert_eq!(missing.len(), 2);
            assert_eq!(unknown, vec!["nope".to_string()]);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(workflow, before);

    workflow.reorder(&original).unwrap();
    assert_eq!(step_ids(&workflow), original);
}

#[test]
fn test_stored_workflows_and_sources() {
    let env = TestEnv::new();
    let workflow = sample();
    env.db.save_workflow(&workflow).unwrap();

    let stored = env.db.get_workflow(&workflow.id).unwrap().unwrap();
    assert_eq!(stored.name, workflow.name);
    assert_eq!(step_ids(&stored), step_ids(&workflow));
    assert_eq!(stored.steps[1].parameters, workflow.steps[1].parameters);
    assert_eq!(env.db.list_workflows().unwrap().len(), 1);

    let cats = SavedSource::new("cats", SourceConfig::remote("danbooru", ["cat", "solo"], Some(20)));
    let local = SavedSource::new("shots", SourceConfig::local(&env.input));
    env.db.save_source(&cats).unwrap();
    env.db.save_source(&local).unwrap();

    let found = env
        .db
        .find_source_by_tags(&["solo".to_string(), "cat".to_string()])
        .unwrap()
        .unwrap();
    assert_eq!(found.label, "cats");
    assert_eq!(env.db.get_source("shots").unwrap().unwrap().config, local.config);

    assert!(env.db.delete_workflow(&workflow.id).unwrap());
    assert!(env.db.get_workflow(&workflow.id).unwrap().is_none());
    assert!(env.db.delete_source("cats").unwrap());
    assert_eq!(env.db.list_sources().unwrap().len(), 1);
}
