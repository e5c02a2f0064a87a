use std::collections::BTreeMap;
use std::path::Path;

use conveyor::definition::{PipelineDefinition, StageSpec, WorkspaceSpec};
use conveyor::pipeline::{
    RunOptions, RunStatus, StageParameters, StageRegistry, StageStatus, build_pipeline,
};
use conveyor::secrets::MemoryStore;
use conveyor::stages;
use serde_json::json;
use tempfile::tempdir;

fn registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn stage(kind: &str, name: Option<&str>, params: &[(&str, serde_json::Value)]) -> StageSpec {
    let mut map = StageParameters::new();
    for (key, value) in params {
        map.insert((*key).to_string(), value.clone());
    }
    StageSpec {
        stage: kind.to_string(),
        name: name.map(str::to_string),
        params: (!map.is_empty()).then_some(map),
        fatal: true,
        always_run: false,
        credentials: Vec::new(),
        timeout_secs: None,
    }
}

fn analysis_stage(exit_code: i32) -> StageSpec {
    stage(
        "analysis",
        Some("static-analysis"),
        &[
            ("command", json!("sh")),
            ("args", json!(["-c", format!("exit {exit_code}")])),
        ],
    )
}

fn marker_stage() -> StageSpec {
    stage(
        "command",
        Some("after-gate"),
        &[
            ("command", json!("sh")),
            ("args", json!(["-c", "touch after-gate.marker"])),
        ],
    )
}

fn definition(stages: Vec<StageSpec>) -> PipelineDefinition {
    PipelineDefinition {
        version: 1,
        name: "gated".to_string(),
        parameters: Vec::new(),
        stages,
        publish: None,
        workspace: WorkspaceSpec::default(),
    }
}

fn run_options(workdir: &Path) -> RunOptions {
    RunOptions {
        build_id: 7,
        overrides: BTreeMap::new(),
        workdir: Some(workdir.to_path_buf()),
    }
}

#[test]
fn strict_gate_aborts_on_failing_verdict() {
    let temp = tempdir().unwrap();
    let definition = definition(vec![
        analysis_stage(2),
        stage("quality-gate", None, &[("policy", json!("strict"))]),
        marker_stage(),
    ]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Aborted);
    let gate = run.stage("quality-gate").unwrap();
    assert_eq!(gate.status, StageStatus::Failed);
    assert!(gate.error.as_deref().unwrap().contains("rejected"));
    assert_eq!(run.stage("after-gate").unwrap().status, StageStatus::Skipped);
    assert!(!temp.path().join("after-gate.marker").exists());

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.gate_failures, 1);
    assert_eq!(snapshot.gate_passes, 0);
}

#[test]
fn advisory_gate_records_failure_and_run_completes() {
    let temp = tempdir().unwrap();
    let definition = definition(vec![
        analysis_stage(2),
        stage("quality-gate", None, &[("policy", json!("advisory"))]),
        marker_stage(),
    ]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        run.stage("quality-gate").unwrap().status,
        StageStatus::Succeeded
    );
    assert_eq!(
        run.metadata
            .get("gate.advisory_failure")
            .and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        run.metadata.get("gate.verdict").and_then(|v| v.as_str()),
        Some("fail")
    );
    assert!(temp.path().join("after-gate.marker").exists());

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.gate_failures, 1);
}

#[test]
fn passing_verdict_clears_the_gate() {
    let temp = tempdir().unwrap();
    let definition = definition(vec![
        analysis_stage(0),
        stage("quality-gate", None, &[("policy", json!("strict"))]),
        marker_stage(),
    ]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        run.metadata.get("analysis.verdict").and_then(|v| v.as_str()),
        Some("pass")
    );
    assert!(temp.path().join("after-gate.marker").exists());

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.gate_passes, 1);
    assert_eq!(snapshot.gate_failures, 0);
}

#[test]
fn gate_without_recorded_verdict_fails_the_stage() {
    let temp = tempdir().unwrap();
    let definition = definition(vec![stage(
        "quality-gate",
        None,
        &[("policy", json!("strict"))],
    )]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Aborted);
    let gate = run.stage("quality-gate").unwrap();
    assert!(gate.error.as_deref().unwrap().contains("no verdict"));
}
