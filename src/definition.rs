use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::params::ParameterSpec;
use crate::pipeline::StageParameters;
use crate::publish::PublishSpec;
use crate::secrets::CredentialRequest;

/// A pipeline definition as loaded from YAML: the parameter schema, the
/// ordered stage list and the publish/workspace coordinates. Immutable for
/// the lifetime of a run.
#[derive(Debug, Deserialize)]
pub struct PipelineDefinition {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub publish: Option<PublishSpec>,
    #[serde(default)]
    pub workspace: WorkspaceSpec,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        let definition: PipelineDefinition = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))?;
        Ok(definition)
    }
}

/// One ordered unit of pipeline work. `fatal` controls whether a failure
/// aborts the run; `always_run` marks finally-style stages (cleanup) that
/// still execute after an abort; `credentials` names the secrets scoped to
/// this stage's execution.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub params: Option<StageParameters>,
    #[serde(default = "default_fatal")]
    pub fatal: bool,
    #[serde(default)]
    pub always_run: bool,
    #[serde(default)]
    pub credentials: Vec<CredentialRequest>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StageSpec {
    /// Display name: the optional override, falling back to the stage kind.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.stage)
    }
}

fn default_fatal() -> bool {
    true
}

/// Where the run executes and which files it leaves behind worth keeping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceSpec {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Glob patterns, relative to the workspace, collected into the archive
    /// directory after the run.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default = "default_archive_directory")]
    pub archive_directory: PathBuf,
}

impl Default for WorkspaceSpec {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            artifacts: Vec::new(),
            archive_directory: default_archive_directory(),
        }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_archive_directory() -> PathBuf {
    PathBuf::from("archive")
}
