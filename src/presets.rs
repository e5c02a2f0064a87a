use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_yaml::Value;

use crate::secrets::CredentialRequest;

#[derive(Debug, Serialize)]
struct PresetDefinition {
    version: u32,
    name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parameters: Vec<ParameterEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workspace: Option<WorkspaceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    publish: Option<PublishEntry>,
    stages: Vec<StageEntry>,
}

#[derive(Debug, Serialize)]
struct ParameterEntry {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkspaceEntry {
    directory: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    artifacts: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PublishEntry {
    registry: String,
    repository: String,
    update_latest: bool,
}

#[derive(Debug, Serialize)]
struct StageEntry {
    stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fatal: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    always_run: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    credentials: Vec<CredentialRequest>,
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = match name {
        "container-delivery" => container_delivery_preset(),
        "minimal" => minimal_preset(),
        other => anyhow::bail!("Unknown preset '{other}'"),
    };

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset pipeline: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// The full delivery workflow: checkout, analysis behind a strict gate,
/// dependency install, advisory vulnerability scan, image build, registry
/// publish under scoped credentials, best-effort cleanup.
fn container_delivery_preset() -> PresetDefinition {
    PresetDefinition {
        version: 1,
        name: "container-delivery".into(),
        parameters: vec![
            parameter("repo_name", Some("demo-ecr")),
            parameter("account_id", Some("123456789012")),
            parameter("region", Some("us-east-1")),
            parameter("repo_url", Some("https://github.com/example/demo-app.git")),
        ],
        workspace: Some(WorkspaceEntry {
            directory: PathBuf::from("."),
            artifacts: vec!["reports/*.txt".into()],
        }),
        publish: Some(PublishEntry {
            registry: "{account_id}.dkr.ecr.{region}.amazonaws.com".into(),
            repository: "{repo_name}".into(),
            update_latest: true,
        }),
        stages: vec![
            stage(
                "command",
                Some("checkout"),
                Some(command_params("git", &["clone", "{repo_url}", "."])),
            ),
            stage(
                "analysis",
                Some("static-analysis"),
                Some(command_params(
                    "sonar-scanner",
                    &["-Dsonar.projectKey={repo_name}"],
                )),
            ),
            stage("quality-gate", None, Some(gate_params("strict"))),
            stage(
                "command",
                Some("dependencies"),
                Some(command_params("npm", &["install"])),
            ),
            StageEntry {
                fatal: Some(false),
                ..stage(
                    "scan",
                    Some("vulnerability-scan"),
                    Some(scan_params(
                        "trivy",
                        &["fs", "--no-progress", "."],
                        "reports/vulnerability-scan.txt",
                    )),
                )
            },
            stage("image-build", None, Some(build_params("{repo_name}:{build_id}"))),
            StageEntry {
                credentials: vec![
                    CredentialRequest::Mapped {
                        secret: "accessKey".into(),
                        env: "AWS_ACCESS_KEY_ID".into(),
                    },
                    CredentialRequest::Mapped {
                        secret: "secretKey".into(),
                        env: "AWS_SECRET_ACCESS_KEY".into(),
                    },
                ],
                ..stage("publish", None, None)
            },
            StageEntry {
                fatal: Some(false),
                always_run: true,
                ..stage("cleanup", None, None)
            },
        ],
    }
}

fn minimal_preset() -> PresetDefinition {
    PresetDefinition {
        version: 1,
        name: "minimal".into(),
        parameters: vec![parameter("repo_name", Some("demo"))],
        workspace: None,
        publish: Some(PublishEntry {
            registry: "registry.example.com".into(),
            repository: "{repo_name}".into(),
            update_latest: true,
        }),
        stages: vec![
            stage(
                "command",
                Some("build-info"),
                Some(command_params("uname", &["-a"])),
            ),
            stage("image-build", None, None),
            stage("publish", None, None),
            StageEntry {
                fatal: Some(false),
                always_run: true,
                ..stage("cleanup", None, None)
            },
        ],
    }
}

fn parameter(name: &str, default: Option<&str>) -> ParameterEntry {
    ParameterEntry {
        name: name.into(),
        default: default.map(Into::into),
    }
}

fn stage(kind: &str, name: Option<&str>, params: Option<BTreeMap<String, Value>>) -> StageEntry {
    StageEntry {
        stage: kind.into(),
        name: name.map(Into::into),
        params,
        fatal: None,
        always_run: false,
        credentials: Vec::new(),
    }
}

fn command_params(command: &str, args: &[&str]) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    params.insert("command".into(), val_str(command));
    params.insert(
        "args".into(),
        Value::Sequence(args.iter().map(|arg| val_str(arg)).collect()),
    );
    params
}

fn scan_params(command: &str, args: &[&str], report: &str) -> BTreeMap<String, Value> {
    let mut params = command_params(command, args);
    params.insert("report".into(), val_str(report));
    params
}

fn gate_params(policy: &str) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    params.insert("policy".into(), val_str(policy));
    params
}

fn build_params(image: &str) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    params.insert("image".into(), val_str(image));
    params.insert("context".into(), val_str("."));
    params
}

fn val_str(value: &str) -> Value {
    Value::String(value.to_string())
}
