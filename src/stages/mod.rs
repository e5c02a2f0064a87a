use serde_json::{Value, json};
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::gate::{self, GatePolicy, Verdict};
use crate::pipeline::{PipelineRun, Stage, StageExec, StageParameters, StageRegistry};
use crate::publish;
use crate::security::compute_sha256;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("command", |params| {
        Ok(Box::new(CommandStage::from_params(params)?))
    });
    registry.register("analysis", |params| {
        Ok(Box::new(AnalysisStage::from_params(params)?))
    });
    registry.register("quality-gate", |params| {
        Ok(Box::new(QualityGateStage::from_params(params)?))
    });
    registry.register("scan", |params| {
        Ok(Box::new(ScanStage::from_params(params)?))
    });
    registry.register("image-build", |params| {
        Ok(Box::new(ImageBuildStage::from_params(params)?))
    });
    registry.register("publish", |params| {
        Ok(Box::new(PublishStage::from_params(params)?))
    });
    registry.register("cleanup", |params| {
        Ok(Box::new(CleanupStage::from_params(params)?))
    });
}

/// Generic external command stage: checkout, dependency install, anything the
/// workflow needs that has no richer built-in.
#[derive(Debug)]
struct CommandStage {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandStage {
    fn from_params(mut params: StageParameters) -> Result<Self, PipelineError> {
        let command = take_string(&mut params, "command").ok_or_else(|| {
            PipelineError::validation("command stage requires 'command' parameter")
        })?;
        let args = take_string_vec(&mut params, "args")?;
        let env = take_env_map(&mut params, "env")?;
        Ok(Self { command, args, env })
    }
}

impl Stage for CommandStage {
    fn kind(&self) -> &'static str {
        "command"
    }

    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError> {
        let command = exec.expand(&self.command);
        let args: Vec<String> = self.args.iter().map(|arg| exec.expand(arg)).collect();
        let env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(key, value)| (key.clone(), exec.expand(value)))
            .collect();

        let result = exec.invoke(&command, &args, &env)?;
        let prefix = exec.stage_name;
        run.metadata
            .insert(format!("{prefix}.exit_code"), json!(result.exit_code));
        run.metadata.insert(
            format!("{prefix}.output"),
            Value::String(result.combined_output()),
        );

        if result.success() {
            Ok(())
        } else {
            Err(PipelineError::ToolExecution {
                command,
                exit_code: result.exit_code,
            })
        }
    }
}

/// Runs the static-analysis client and records the verdict for the quality
/// gate. The analysis server's own exit status carries the verdict; the
/// stage itself only fails when the client cannot run at all.
struct AnalysisStage {
    command: String,
    args: Vec<String>,
}

impl AnalysisStage {
    fn from_params(mut params: StageParameters) -> Result<Self, PipelineError> {
        let command = take_string(&mut params, "command").ok_or_else(|| {
            PipelineError::validation("analysis stage requires 'command' parameter")
        })?;
        let args = take_string_vec(&mut params, "args")?;
        Ok(Self { command, args })
    }
}

impl Stage for AnalysisStage {
    fn kind(&self) -> &'static str {
        "analysis"
    }

    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError> {
        let command = exec.expand(&self.command);
        let args: Vec<String> = self.args.iter().map(|arg| exec.expand(arg)).collect();

        let result = exec.invoke(&command, &args, &[])?;
        let verdict = Verdict::from_exit_code(result.exit_code);
        info!(verdict = %verdict, exit_code = result.exit_code, "Analysis verdict recorded");

        run.metadata
            .insert("analysis.verdict".to_string(), json!(verdict.to_string()));
        run.metadata
            .insert("analysis.exit_code".to_string(), json!(result.exit_code));
        run.metadata.insert(
            "analysis.output".to_string(),
            Value::String(result.combined_output()),
        );
        Ok(())
    }
}

/// Consults the recorded analysis verdict under the configured abort policy.
struct QualityGateStage {
    policy: GatePolicy,
    verdict_key: String,
}

impl QualityGateStage {
    fn from_params(mut params: StageParameters) -> Result<Self, PipelineError> {
        let policy = match take_string(&mut params, "policy") {
            None => GatePolicy::default(),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "strict" => GatePolicy::Strict,
                "advisory" => GatePolicy::Advisory,
                other => {
                    return Err(PipelineError::validation(format!(
                        "quality-gate policy must be 'strict' or 'advisory', got '{other}'"
                    )));
                }
            },
        };
        let verdict_key =
            take_string(&mut params, "verdict_key").unwrap_or_else(|| "analysis.verdict".into());
        Ok(Self {
            policy,
            verdict_key,
        })
    }
}

impl Stage for QualityGateStage {
    fn kind(&self) -> &'static str {
        "quality-gate"
    }

    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError> {
        let verdict: Verdict = run
            .metadata
            .get(&self.verdict_key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "quality gate found no verdict under '{}'; an analysis stage must run first",
                    self.verdict_key
                ))
            })?
            .parse()
            .map_err(PipelineError::Validation)?;

        let decision = gate::evaluate(self.policy, verdict);
        run.metadata
            .insert("gate.policy".to_string(), json!(self.policy));
        run.metadata
            .insert("gate.verdict".to_string(), json!(verdict.to_string()));

        match (decision.blocking, verdict) {
            (true, _) => {
                exec.ctx.metrics.record_gate_failure();
                Err(PipelineError::GateFailure {
                    gate: exec.stage_name.to_string(),
                    reason: format!("analysis verdict '{verdict}' under strict policy"),
                })
            }
            (false, Verdict::Fail) => {
                exec.ctx.metrics.record_gate_failure();
                run.metadata
                    .insert("gate.advisory_failure".to_string(), json!(true));
                warn!("Quality gate verdict is 'fail'; advisory policy lets the run continue");
                Ok(())
            }
            (false, Verdict::Pass) => {
                exec.ctx.metrics.record_gate_pass();
                Ok(())
            }
        }
    }
}

/// Vulnerability scanner stage: captures the scanner's output into a report
/// file and fingerprints it. Whether a nonzero exit blocks the run is the
/// stage spec's `fatal` flag, not this stage's decision.
struct ScanStage {
    command: String,
    args: Vec<String>,
    report: Option<String>,
}

impl ScanStage {
    fn from_params(mut params: StageParameters) -> Result<Self, PipelineError> {
        let command = take_string(&mut params, "command")
            .ok_or_else(|| PipelineError::validation("scan stage requires 'command' parameter"))?;
        let args = take_string_vec(&mut params, "args")?;
        let report = take_string(&mut params, "report");
        Ok(Self {
            command,
            args,
            report,
        })
    }
}

impl Stage for ScanStage {
    fn kind(&self) -> &'static str {
        "scan"
    }

    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError> {
        let command = exec.expand(&self.command);
        let args: Vec<String> = self.args.iter().map(|arg| exec.expand(arg)).collect();

        let result = exec.invoke(&command, &args, &[])?;
        run.metadata
            .insert("scan.exit_code".to_string(), json!(result.exit_code));

        if let Some(report) = &self.report {
            let path = exec.ctx.workdir.join(exec.expand(report));
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
                    context: format!(
                        "failed to create report directory '{}'",
                        parent.display()
                    ),
                    source,
                })?;
            }
            std::fs::write(&path, result.combined_output()).map_err(|source| {
                PipelineError::Io {
                    context: format!("failed to write scan report '{}'", path.display()),
                    source,
                }
            })?;
            run.metadata.insert(
                "scan.report".to_string(),
                Value::String(path.to_string_lossy().to_string()),
            );
            if let Ok(digest) = compute_sha256(&path) {
                run.metadata
                    .insert("scan.report_digest".to_string(), Value::String(digest));
            }
        } else {
            run.metadata.insert(
                "scan.output".to_string(),
                Value::String(result.combined_output()),
            );
        }

        if result.success() {
            Ok(())
        } else {
            Err(PipelineError::ToolExecution {
                command,
                exit_code: result.exit_code,
            })
        }
    }
}

/// Builds the container image and records the local reference the publish
/// stage picks up.
struct ImageBuildStage {
    builder: String,
    context: String,
    dockerfile: Option<String>,
    image: String,
}

impl ImageBuildStage {
    fn from_params(mut params: StageParameters) -> Result<Self, PipelineError> {
        let builder = take_string(&mut params, "builder").unwrap_or_else(|| "docker".into());
        let context = take_string(&mut params, "context").unwrap_or_else(|| ".".into());
        let dockerfile = take_string(&mut params, "dockerfile");
        let image =
            take_string(&mut params, "image").unwrap_or_else(|| "{pipeline}:{build_id}".into());
        Ok(Self {
            builder,
            context,
            dockerfile,
            image,
        })
    }
}

impl Stage for ImageBuildStage {
    fn kind(&self) -> &'static str {
        "image-build"
    }

    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError> {
        let image = exec.expand(&self.image);
        let mut args = vec!["build".to_string(), "-t".to_string(), image.clone()];
        if let Some(dockerfile) = &self.dockerfile {
            args.push("-f".to_string());
            args.push(exec.expand(dockerfile));
        }
        args.push(exec.expand(&self.context));

        let result = exec.invoke(&self.builder, &args, &[])?;
        run.metadata
            .insert("image.build_exit_code".to_string(), json!(result.exit_code));

        if result.success() {
            info!(image = %image, "Image built");
            run.metadata
                .insert("image.reference".to_string(), Value::String(image));
            Ok(())
        } else {
            Err(PipelineError::ToolExecution {
                command: self.builder.clone(),
                exit_code: result.exit_code,
            })
        }
    }
}

/// Tags the built image and pushes each tag, build-identifier tag first.
struct PublishStage;

impl PublishStage {
    fn from_params(params: StageParameters) -> Result<Self, PipelineError> {
        if !params.is_empty() {
            return Err(PipelineError::validation(
                "publish stage takes no parameters; configure the top-level 'publish' section",
            ));
        }
        Ok(Self)
    }
}

impl Stage for PublishStage {
    fn kind(&self) -> &'static str {
        "publish"
    }

    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError> {
        let spec = exec.ctx.publish.as_ref().ok_or_else(|| {
            PipelineError::validation("publish stage requires a 'publish' section in the pipeline")
        })?;

        // An image is never pushed unless its build stage succeeded.
        let image = run
            .metadata
            .get("image.reference")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PipelineError::validation(
                    "publish stage found no built image; an image-build stage must succeed first",
                )
            })?
            .to_string();

        let tags = publish::tag_refs(spec, &exec.ctx.params, exec.ctx.build_id);
        run.metadata
            .insert("publish.tags".to_string(), json!(tags.all()));

        let (env, redact) = match exec.credentials {
            Some(creds) => (
                creds
                    .env()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
                creds.redactions(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let report = publish::tag_and_push(
            &spec.client,
            &image,
            &tags,
            &exec.ctx.workdir,
            &env,
            &redact,
        )?;

        run.metadata
            .insert("publish.pushed".to_string(), json!(report.pushed));
        run.metadata
            .insert("publish.unpushed".to_string(), json!(report.unpushed));
        run.metadata
            .insert("publish.partial".to_string(), json!(report.is_partial()));

        if report.is_complete() {
            exec.ctx.metrics.record_publish();
            Ok(())
        } else {
            if report.is_partial() {
                exec.ctx.metrics.record_partial_publish();
            }
            let reference = report
                .unpushed
                .first()
                .cloned()
                .unwrap_or_else(|| tags.build.clone());
            Err(PipelineError::Publish {
                reference,
                reason: report
                    .failure
                    .unwrap_or_else(|| "registry client failure".to_string()),
            })
        }
    }
}

/// Removes the locally tagged references, best effort. Declared with
/// `always_run: true` so it still fires when the publish stage aborts the
/// run.
struct CleanupStage;

impl CleanupStage {
    fn from_params(params: StageParameters) -> Result<Self, PipelineError> {
        if !params.is_empty() {
            return Err(PipelineError::validation(
                "cleanup stage takes no parameters",
            ));
        }
        Ok(Self)
    }
}

impl Stage for CleanupStage {
    fn kind(&self) -> &'static str {
        "cleanup"
    }

    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError> {
        let Some(spec) = exec.ctx.publish.as_ref() else {
            // Nothing was tagged, nothing to remove.
            return Ok(());
        };

        let mut tags: Vec<String> = run
            .metadata
            .get("publish.tags")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| {
                publish::tag_refs(spec, &exec.ctx.params, exec.ctx.build_id).all()
            });

        if let Some(image) = run.metadata.get("image.reference").and_then(Value::as_str)
            && !tags.iter().any(|tag| tag.as_str() == image)
        {
            tags.push(image.to_string());
        }

        let report = crate::cleanup::remove_local_tags(&spec.client, &tags, &exec.ctx.workdir);
        exec.ctx
            .metrics
            .record_cleanup_warnings(report.warnings.len() as u64);
        run.metadata
            .insert("cleanup.removed".to_string(), json!(report.removed));
        run.metadata.insert(
            "cleanup.warnings".to_string(),
            json!(
                report
                    .warnings
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            ),
        );
        Ok(())
    }
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn take_string_vec(
    params: &mut StageParameters,
    key: &str,
) -> Result<Vec<String>, PipelineError> {
    match params.remove(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(values)) => values
            .into_iter()
            .map(|value| match value {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(PipelineError::validation(format!(
                    "'{key}' entries must be strings, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(PipelineError::validation(format!(
            "'{key}' must be an array, got {other}"
        ))),
    }
}

fn take_env_map(
    params: &mut StageParameters,
    key: &str,
) -> Result<Vec<(String, String)>, PipelineError> {
    match params.remove(key) {
        None => Ok(Vec::new()),
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(s) => Ok((name, s)),
                Value::Number(n) => Ok((name, n.to_string())),
                Value::Bool(b) => Ok((name, b.to_string())),
                other => Err(PipelineError::validation(format!(
                    "'{key}.{name}' must be a scalar, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(PipelineError::validation(format!(
            "'{key}' must be a mapping, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_stage_requires_command_param() {
        let err = CommandStage::from_params(StageParameters::new()).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn quality_gate_rejects_unknown_policy() {
        let mut params = StageParameters::new();
        params.insert("policy".to_string(), json!("lenient"));
        assert!(QualityGateStage::from_params(params).is_err());
    }

    #[test]
    fn publish_stage_rejects_stray_params() {
        let mut params = StageParameters::new();
        params.insert("registry".to_string(), json!("example.com"));
        assert!(PublishStage::from_params(params).is_err());
    }
}
