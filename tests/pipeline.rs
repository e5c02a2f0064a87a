use std::collections::BTreeMap;
use std::path::Path;

use conveyor::definition::{PipelineDefinition, StageSpec, WorkspaceSpec};
use conveyor::pipeline::{
    RunOptions, RunStatus, StageRegistry, StageStatus, build_pipeline,
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

fn shell_stage(name: &str, script: &str) -> StageSpec {
    let mut params = conveyor::pipeline::StageParameters::new();
    params.insert("command".to_string(), json!("sh"));
    params.insert("args".to_string(), json!(["-c", script]));
    StageSpec {
        stage: "command".to_string(),
        name: Some(name.to_string()),
        params: Some(params),
        fatal: true,
        always_run: false,
        credentials: Vec::new(),
        timeout_secs: None,
    }
}

fn definition(stages: Vec<StageSpec>) -> PipelineDefinition {
    PipelineDefinition {
        version: 1,
        name: "test-pipeline".to_string(),
        parameters: Vec::new(),
        stages,
        publish: None,
        workspace: WorkspaceSpec::default(),
    }
}

fn run_options(workdir: &Path) -> RunOptions {
    RunOptions {
        build_id: 42,
        overrides: BTreeMap::new(),
        workdir: Some(workdir.to_path_buf()),
    }
}

#[test]
fn run_succeeds_and_records_outcomes() {
    let temp = tempdir().unwrap();
    let definition = definition(vec![
        shell_stage("first", "echo hello"),
        shell_stage("second", "echo world"),
    ]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.succeeded());
    assert_eq!(run.stages.len(), 2);
    assert!(
        run.stages
            .iter()
            .all(|outcome| outcome.status == StageStatus::Succeeded)
    );
    assert_eq!(
        run.metadata.get("first.exit_code").and_then(|v| v.as_i64()),
        Some(0)
    );
    assert_eq!(
        run.metadata.get("first.output").and_then(|v| v.as_str()),
        Some("hello\n")
    );

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.stages.get("first").unwrap().calls, 1);
    assert_eq!(snapshot.stages.get("second").unwrap().calls, 1);
    assert!(snapshot.total_duration_ms >= 0.0);
}

#[test]
fn fatal_failure_aborts_and_skips_remaining_stages() {
    let temp = tempdir().unwrap();
    let definition = definition(vec![
        shell_stage("install", "exit 1"),
        shell_stage("build", "touch built.marker"),
    ]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.stage("install").unwrap().status, StageStatus::Failed);
    assert_eq!(run.stage("build").unwrap().status, StageStatus::Skipped);
    assert!(
        !temp.path().join("built.marker").exists(),
        "stages after a fatal failure must not execute"
    );

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.stages.get("install").unwrap().failures, 1);
    assert!(!snapshot.stages.contains_key("build"));
}

#[test]
fn non_fatal_failure_is_recorded_and_run_continues() {
    let temp = tempdir().unwrap();
    let mut scan = shell_stage("scan", "exit 1");
    scan.fatal = false;
    let definition = definition(vec![scan, shell_stage("build", "touch built.marker")]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);
    let scan_outcome = run.stage("scan").unwrap();
    assert_eq!(scan_outcome.status, StageStatus::Failed);
    assert!(scan_outcome.error.as_deref().unwrap().contains("exited"));
    assert_eq!(run.stage("build").unwrap().status, StageStatus::Succeeded);
    assert!(temp.path().join("built.marker").exists());
}

#[test]
fn always_run_stage_executes_after_abort() {
    let temp = tempdir().unwrap();
    let mut finally = shell_stage("teardown", "touch teardown.marker");
    finally.fatal = false;
    finally.always_run = true;
    let definition = definition(vec![
        shell_stage("install", "exit 1"),
        shell_stage("build", "touch built.marker"),
        finally,
    ]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.stage("build").unwrap().status, StageStatus::Skipped);
    assert_eq!(run.stage("teardown").unwrap().status, StageStatus::Succeeded);
    assert!(!temp.path().join("built.marker").exists());
    assert!(temp.path().join("teardown.marker").exists());
}

#[test]
fn stage_timeout_is_a_fatal_failure() {
    let temp = tempdir().unwrap();
    let mut slow = shell_stage("slow", "sleep 30");
    slow.timeout_secs = Some(1);
    let definition = definition(vec![slow, shell_stage("after", "touch after.marker")]);

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let started = std::time::Instant::now();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert!(started.elapsed() < std::time::Duration::from_secs(15));
    assert_eq!(run.status, RunStatus::Aborted);
    let slow_outcome = run.stage("slow").unwrap();
    assert_eq!(slow_outcome.status, StageStatus::Failed);
    assert!(slow_outcome.error.as_deref().unwrap().contains("timeout"));
    assert_eq!(run.stage("after").unwrap().status, StageStatus::Skipped);
}

#[test]
fn workspace_artifacts_are_archived_with_digests() {
    let temp = tempdir().unwrap();
    let mut definition = definition(vec![shell_stage(
        "report",
        "mkdir -p reports && echo findings > reports/scan.txt",
    )]);
    definition.workspace.artifacts = vec!["reports/*.txt".to_string()];

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.artifacts.len(), 1);
    assert_eq!(run.artifacts[0].digest.len(), 64);
    assert!(temp.path().join("archive/42/scan.txt").is_file());
}

#[test]
fn parameters_expand_into_stage_commands() {
    let temp = tempdir().unwrap();
    let mut definition = definition(vec![shell_stage(
        "greet",
        "echo repo={repo_name} build={build_id}",
    )]);
    definition.parameters = vec![conveyor::params::ParameterSpec {
        name: "repo_name".to_string(),
        default: Some("demo-ecr".to_string()),
        kind: conveyor::params::ParameterKind::String,
        description: None,
    }];

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(
        run.metadata.get("greet.output").and_then(|v| v.as_str()),
        Some("repo=demo-ecr build=42\n")
    );
}
