use std::collections::HashSet;

use serde::Serialize;

use crate::definition::{PipelineDefinition, StageSpec};
use crate::pipeline::StageRegistry;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_definition(
    definition: &PipelineDefinition,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if definition.version != 1 {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", definition.version));
    }

    if definition.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if definition.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let mut seen_parameters = HashSet::new();
    for spec in &definition.parameters {
        if spec.name.trim().is_empty() {
            report.errors.push("Parameter names cannot be empty".into());
        }
        if !seen_parameters.insert(spec.name.clone()) {
            report
                .errors
                .push(format!("Parameter '{}' is declared twice", spec.name));
        }
    }

    if definition
        .stages
        .iter()
        .any(|stage| stage.stage == "publish")
        && definition.publish.is_none()
    {
        report.errors.push(
            "A publish stage is declared but the pipeline has no 'publish' section".into(),
        );
    }

    for (idx, stage) in definition.stages.iter().enumerate() {
        report.merge(validate_stage_order(idx, stage, &definition.stages));
        report.merge(validate_stage(idx, stage, registry));
    }

    report
}

fn validate_stage(idx: usize, stage: &StageSpec, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    let params = stage.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(&stage.stage, params) {
        report.errors.push(format!(
            "Stage {} ('{}'): {}",
            idx + 1,
            stage.display_name(),
            err
        ));
    }

    if stage.timeout_secs == Some(0) {
        report.errors.push(format!(
            "Stage {} ('{}'): timeout_secs must be greater than zero",
            idx + 1,
            stage.display_name()
        ));
    }

    for request in &stage.credentials {
        if request.secret().trim().is_empty() || request.env_name().trim().is_empty() {
            report.errors.push(format!(
                "Stage {} ('{}'): credential names cannot be empty",
                idx + 1,
                stage.display_name()
            ));
        }
    }

    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, stages: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let earlier = &stages[..idx];

    match stage.stage.as_str() {
        "quality-gate" => {
            if !earlier.iter().any(|prev| prev.stage == "analysis") {
                report.errors.push(
                    "Quality gate must follow an analysis stage that produces a verdict".into(),
                );
            }
        }
        "publish" => {
            if !earlier.iter().any(|prev| prev.stage == "image-build") {
                report.errors.push(
                    "Publish stage requires an image-build stage earlier in the pipeline".into(),
                );
            }
        }
        "cleanup" => {
            if !earlier.iter().any(|prev| prev.stage == "publish") {
                report.errors.push(
                    "Cleanup stage must come after the publish stage it cleans up for".into(),
                );
            }
            if !stage.always_run {
                report.warnings.push(
                    "Cleanup stage is not marked always_run; it will be skipped when an earlier stage aborts the run"
                        .into(),
                );
            }
        }
        _ => {}
    }

    report
}
