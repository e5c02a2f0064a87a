use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use conveyor::cleanup::remove_local_tags;
use conveyor::definition::{PipelineDefinition, StageSpec, WorkspaceSpec};
use conveyor::pipeline::{
    RunOptions, RunStatus, StageParameters, StageRegistry, StageStatus, build_pipeline,
};
use conveyor::publish::PublishSpec;
use conveyor::secrets::{CredentialRequest, MemoryStore};
use conveyor::stages;
use serde_json::json;
use tempfile::tempdir;

fn registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

/// Stand-in registry client: records every invocation and runs the given
/// shell body for its exit behavior.
fn write_fake_client(dir: &Path, log: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-docker");
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> \"{}\"\n{}\nexit 0\n",
        log.display(),
        body
    );
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn read_log(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn publish_definition(client: &Path, with_credentials: bool) -> PipelineDefinition {
    let mut build_params = StageParameters::new();
    build_params.insert("builder".to_string(), json!(client.to_string_lossy()));
    build_params.insert("image".to_string(), json!("demo:{build_id}"));
    build_params.insert("context".to_string(), json!("."));

    let credentials = if with_credentials {
        vec![
            CredentialRequest::Mapped {
                secret: "accessKey".to_string(),
                env: "AWS_ACCESS_KEY_ID".to_string(),
            },
            CredentialRequest::Mapped {
                secret: "secretKey".to_string(),
                env: "AWS_SECRET_ACCESS_KEY".to_string(),
            },
        ]
    } else {
        Vec::new()
    };

    PipelineDefinition {
        version: 1,
        name: "publishing".to_string(),
        parameters: vec![
            conveyor::params::ParameterSpec {
                name: "repo_name".to_string(),
                default: Some("demo-ecr".to_string()),
                kind: conveyor::params::ParameterKind::String,
                description: None,
            },
            conveyor::params::ParameterSpec {
                name: "account_id".to_string(),
                default: Some("123456789012".to_string()),
                kind: conveyor::params::ParameterKind::String,
                description: None,
            },
            conveyor::params::ParameterSpec {
                name: "region".to_string(),
                default: Some("us-east-1".to_string()),
                kind: conveyor::params::ParameterKind::String,
                description: None,
            },
        ],
        stages: vec![
            StageSpec {
                stage: "image-build".to_string(),
                name: None,
                params: Some(build_params),
                fatal: true,
                always_run: false,
                credentials: Vec::new(),
                timeout_secs: None,
            },
            StageSpec {
                stage: "publish".to_string(),
                name: None,
                params: None,
                fatal: true,
                always_run: false,
                credentials,
                timeout_secs: None,
            },
            StageSpec {
                stage: "cleanup".to_string(),
                name: None,
                params: None,
                fatal: false,
                always_run: true,
                credentials: Vec::new(),
                timeout_secs: None,
            },
        ],
        publish: Some(PublishSpec {
            registry: "{account_id}.dkr.ecr.{region}.amazonaws.com".to_string(),
            repository: "{repo_name}".to_string(),
            client: client.to_string_lossy().to_string(),
            update_latest: true,
            latest_tag: "latest".to_string(),
        }),
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

const BUILD_TAG: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/demo-ecr:42";
const LATEST_TAG: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/demo-ecr:latest";

#[test]
fn publish_pushes_build_tag_before_latest_and_cleanup_removes_local_tags() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("client.log");
    let client = write_fake_client(temp.path(), &log, "");

    let mut store = MemoryStore::new();
    store.insert("accessKey", "AKIA123");
    store.insert("secretKey", "wJalr456");

    let definition = publish_definition(&client, true);
    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&store, &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);

    let lines = read_log(&log);
    let build_push = lines
        .iter()
        .position(|line| line == &format!("push {BUILD_TAG}"))
        .expect("build tag push missing");
    let latest_push = lines
        .iter()
        .position(|line| line == &format!("push {LATEST_TAG}"))
        .expect("latest tag push missing");
    assert!(
        build_push < latest_push,
        "build-identifier tag must be pushed before latest"
    );
    assert!(lines.contains(&format!("tag demo:42 {BUILD_TAG}")));
    assert!(lines.contains(&format!("tag demo:42 {LATEST_TAG}")));
    assert!(lines.contains(&format!("rmi {BUILD_TAG}")));
    assert!(lines.contains(&format!("rmi {LATEST_TAG}")));
    assert!(lines.contains(&"rmi demo:42".to_string()));

    assert_eq!(
        run.metadata.get("publish.pushed").unwrap(),
        &json!([BUILD_TAG, LATEST_TAG])
    );
    assert_eq!(
        run.metadata.get("publish.partial").and_then(|v| v.as_bool()),
        Some(false)
    );

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.publishes, 1);
    assert_eq!(snapshot.partial_publishes, 0);
}

#[test]
fn partial_publish_is_reported_distinctly_and_cleanup_still_runs() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("client.log");
    let body = r#"case "$1" in
push)
    case "$2" in
    *:latest) echo "transport reset" >&2; exit 7;;
    esac
    ;;
esac"#;
    let client = write_fake_client(temp.path(), &log, body);

    let definition = publish_definition(&client, false);
    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Aborted);
    let publish_outcome = run.stage("publish").unwrap();
    assert_eq!(publish_outcome.status, StageStatus::Failed);
    assert!(publish_outcome.error.as_deref().unwrap().contains("latest"));

    assert_eq!(
        run.metadata.get("publish.pushed").unwrap(),
        &json!([BUILD_TAG])
    );
    assert_eq!(
        run.metadata.get("publish.unpushed").unwrap(),
        &json!([LATEST_TAG])
    );
    assert_eq!(
        run.metadata.get("publish.partial").and_then(|v| v.as_bool()),
        Some(true)
    );

    // Cleanup is always_run: both local tags are still removed.
    assert_eq!(run.stage("cleanup").unwrap().status, StageStatus::Succeeded);
    let lines = read_log(&log);
    assert!(lines.contains(&format!("rmi {BUILD_TAG}")));
    assert!(lines.contains(&format!("rmi {LATEST_TAG}")));

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.publishes, 0);
    assert_eq!(snapshot.partial_publishes, 1);
}

#[test]
fn update_latest_policy_skips_the_floating_tag() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("client.log");
    let client = write_fake_client(temp.path(), &log, "");

    let mut definition = publish_definition(&client, false);
    definition.publish.as_mut().unwrap().update_latest = false;

    let executor = build_pipeline(&registry(), &definition).unwrap();
    let run = executor.execute(&MemoryStore::new(), &run_options(temp.path()));

    assert_eq!(run.status, RunStatus::Succeeded);
    let lines = read_log(&log);
    assert!(lines.contains(&format!("push {BUILD_TAG}")));
    assert!(!lines.iter().any(|line| line.contains(":latest")));
}

#[test]
fn cleanup_is_idempotent_for_already_removed_tags() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("client.log");
    let state = temp.path().join("removed.state");
    let body = format!(
        r#"if [ "$1" = "rmi" ]; then
    if grep -qF "$2" "{state}" 2>/dev/null; then
        echo "Error: No such image: $2" >&2
        exit 1
    fi
    echo "$2" >> "{state}"
fi"#,
        state = state.display()
    );
    let client = write_fake_client(temp.path(), &log, &body);
    let client = client.to_string_lossy().to_string();

    let tags = vec!["demo:42".to_string(), "demo:latest".to_string()];

    let first = remove_local_tags(&client, &tags, temp.path());
    assert_eq!(first.removed, tags);
    assert!(first.warnings.is_empty());

    let second = remove_local_tags(&client, &tags, temp.path());
    assert!(second.removed.is_empty());
    assert!(
        second.warnings.is_empty(),
        "removing an already-missing tag must not warn"
    );
}
