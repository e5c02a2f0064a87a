use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::definition::{PipelineDefinition, StageSpec};

/// A frozen view of a pipeline definition: stage order plus a hash of each
/// stage's effective configuration, so drift between environments is
/// detectable without diffing YAML by hand.
#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub pipeline: String,
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub parameters: Vec<ParameterLock>,
    pub stages: Vec<StageLock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishLock>,
}

#[derive(Debug, Serialize)]
pub struct ParameterLock {
    pub name: String,
    pub has_default: bool,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub kind: String,
    pub fatal: bool,
    pub always_run: bool,
    pub config_hash: String,
}

#[derive(Debug, Serialize)]
pub struct PublishLock {
    pub registry: String,
    pub repository: String,
    pub update_latest: bool,
}

pub fn generate_lock(definition: &PipelineDefinition, path: &Path) -> Result<()> {
    let stages = definition
        .stages
        .iter()
        .map(|spec| StageLock {
            name: spec.display_name().to_string(),
            kind: spec.stage.clone(),
            fatal: spec.fatal,
            always_run: spec.always_run,
            config_hash: hash_stage(spec),
        })
        .collect();

    let lock = PipelineLock {
        pipeline: definition.name.clone(),
        version: definition.version,
        generated_at: Utc::now(),
        parameters: definition
            .parameters
            .iter()
            .map(|spec| ParameterLock {
                name: spec.name.clone(),
                has_default: spec.default.is_some(),
            })
            .collect(),
        stages,
        publish: definition.publish.as_ref().map(|spec| PublishLock {
            registry: spec.registry.clone(),
            repository: spec.repository.clone(),
            update_latest: spec.update_latest,
        }),
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

fn hash_stage(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.stage.as_bytes());
    hasher.update([u8::from(spec.fatal), u8::from(spec.always_run)]);
    let params = serde_json::to_vec(&spec.params.clone().unwrap_or_default()).unwrap_or_default();
    hasher.update(params);
    if let Some(timeout) = spec.timeout_secs {
        hasher.update(timeout.to_le_bytes());
    }
    for request in &spec.credentials {
        hasher.update(request.secret().as_bytes());
        hasher.update(request.env_name().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
