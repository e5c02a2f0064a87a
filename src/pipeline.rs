use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::archive::{self, ArchivedArtifact};
use crate::definition::{PipelineDefinition, StageSpec, WorkspaceSpec};
use crate::errors::PipelineError;
use crate::invoker::{self, ToolRequest, ToolResult};
use crate::observability::MetricsCollector;
use crate::params::{self, ParameterSpec, ResolvedParameters};
use crate::publish::PublishSpec;
use crate::secrets::{self, CredentialSet, SecretStore};

pub type StageParameters = Map<String, Value>;

/// Lifecycle of one pipeline run. `Failed` means the run never started a
/// stage (parameter resolution failed); `Aborted` means a stage failed
/// fatally mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Record of one stage's execution within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub name: String,
    pub kind: String,
    pub status: StageStatus,
    pub fatal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
}

impl StageOutcome {
    fn skipped(name: &str, kind: &str, fatal: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            status: StageStatus::Skipped,
            fatal,
            error: None,
            duration_ms: 0.0,
        }
    }
}

/// One execution of a pipeline definition. Mutated only by the sequencer;
/// stages contribute through the metadata bag.
#[derive(Debug, Serialize)]
pub struct PipelineRun {
    pub pipeline: String,
    pub build_id: u64,
    pub status: RunStatus,
    pub stages: Vec<StageOutcome>,
    pub metadata: Map<String, Value>,
    pub artifacts: Vec<ArchivedArtifact>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    fn new(pipeline: &str, build_id: u64) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            build_id,
            status: RunStatus::Pending,
            stages: Vec::new(),
            metadata: Map::new(),
            artifacts: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|outcome| outcome.name == name)
    }
}

/// Immutable run-scoped context handed to every stage.
pub struct RunContext {
    pub pipeline: String,
    pub build_id: u64,
    pub params: ResolvedParameters,
    pub workdir: PathBuf,
    pub publish: Option<PublishSpec>,
    pub metrics: MetricsCollector,
}

impl RunContext {
    /// Expand `{parameter}` placeholders plus the built-in `{build_id}` and
    /// `{pipeline}` substitutions.
    pub fn expand(&self, template: &str) -> String {
        self.params
            .expand(template)
            .replace("{build_id}", &self.build_id.to_string())
            .replace("{pipeline}", &self.pipeline)
    }
}

/// Per-stage execution handle. Credentialed commands can only be issued
/// through this handle while the stage's credential scope is active.
pub struct StageExec<'a> {
    pub ctx: &'a RunContext,
    pub stage_name: &'a str,
    pub credentials: Option<&'a CredentialSet>,
    pub timeout: Option<Duration>,
}

impl StageExec<'_> {
    pub fn invoke(
        &self,
        command: &str,
        args: &[String],
        extra_env: &[(String, String)],
    ) -> Result<ToolResult, PipelineError> {
        let mut env = extra_env.to_vec();
        let mut redact = Vec::new();
        if let Some(creds) = self.credentials {
            env.extend(
                creds
                    .env()
                    .map(|(key, value)| (key.to_string(), value.to_string())),
            );
            redact = creds.redactions();
        }

        let request = ToolRequest {
            command: command.to_string(),
            args: args.to_vec(),
            env,
            cwd: Some(self.ctx.workdir.clone()),
            timeout: self.timeout,
            redact,
            label: self.stage_name.to_string(),
        };
        invoker::run(&request)
    }

    pub fn expand(&self, template: &str) -> String {
        self.ctx.expand(template)
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> &'static str;
    fn run(&self, run: &mut PipelineRun, exec: &StageExec<'_>) -> Result<(), PipelineError>;
}

type StageConstructor =
    Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>, PipelineError> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>, PipelineError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create(
        &self,
        kind: &str,
        params: StageParameters,
    ) -> Result<Box<dyn Stage>, PipelineError> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            PipelineError::validation(format!(
                "Unknown stage '{}'. Available stages: {}",
                kind,
                self.known_stages().join(", ")
            ))
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Run-time inputs the invoking system supplies for one run.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub build_id: u64,
    pub overrides: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

/// The stage sequencer: drives the declared stage list in order, enforcing
/// fatality, `always_run` and credential-scope semantics.
pub struct PipelineExecutor {
    pipeline: String,
    parameters: Vec<ParameterSpec>,
    stages: Vec<(StageSpec, Box<dyn Stage>)>,
    workspace: WorkspaceSpec,
    publish: Option<PublishSpec>,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|(spec, _)| spec.display_name().to_string())
            .collect()
    }

    /// Execute the run to its terminal status. Never returns an error: every
    /// failure mode lands in the returned run record.
    pub fn execute(&self, secrets: &dyn SecretStore, options: &RunOptions) -> PipelineRun {
        self.metrics.reset();
        let total_start = Instant::now();
        let mut run = PipelineRun::new(&self.pipeline, options.build_id);

        let ctx = match self.resolve_context(options) {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(error = %err, "Run could not start");
                run.status = RunStatus::Failed;
                run.metadata
                    .insert("run.error".to_string(), Value::String(err.to_string()));
                run.ended_at = Some(Utc::now());
                return run;
            }
        };

        run.status = RunStatus::Running;
        let mut abort: Option<String> = None;

        for (spec, stage) in &self.stages {
            let name = spec.display_name().to_string();
            if abort.is_some() && !spec.always_run {
                run.stages
                    .push(StageOutcome::skipped(&name, stage.kind(), spec.fatal));
                continue;
            }

            let span = tracing::span!(tracing::Level::INFO, "stage", stage = name.as_str());
            let _span_guard = span.enter();
            let _timer = self.metrics.start_stage(&name);
            let started = Instant::now();
            let result = self.run_stage(spec, stage.as_ref(), secrets, &mut run, &ctx);
            let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

            match result {
                Ok(()) => {
                    info!(stage = %name, "Stage succeeded");
                    run.stages.push(StageOutcome {
                        name,
                        kind: stage.kind().to_string(),
                        status: StageStatus::Succeeded,
                        fatal: spec.fatal,
                        error: None,
                        duration_ms,
                    });
                }
                Err(err) => {
                    self.metrics.record_stage_failure(&name);
                    if spec.fatal {
                        error!(stage = %name, error = %err, "Fatal stage failure; aborting run");
                        abort = Some(name.clone());
                    } else {
                        warn!(stage = %name, error = %err, "Stage failed; run continues");
                    }
                    run.stages.push(StageOutcome {
                        name,
                        kind: stage.kind().to_string(),
                        status: StageStatus::Failed,
                        fatal: spec.fatal,
                        error: Some(err.to_string()),
                        duration_ms,
                    });
                }
            }
        }

        run.status = if abort.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Succeeded
        };

        self.collect_artifacts(&ctx, &mut run);
        self.metrics.record_total_duration(total_start.elapsed());
        run.ended_at = Some(Utc::now());
        info!(
            pipeline = %run.pipeline,
            build_id = run.build_id,
            status = ?run.status,
            "Run finished"
        );
        run
    }

    fn resolve_context(&self, options: &RunOptions) -> Result<RunContext, PipelineError> {
        let params = params::resolve(&self.parameters, &options.overrides)?;
        let workdir = options
            .workdir
            .clone()
            .unwrap_or_else(|| self.workspace.directory.clone());
        Ok(RunContext {
            pipeline: self.pipeline.clone(),
            build_id: options.build_id,
            params,
            workdir,
            publish: self.publish.clone(),
            metrics: self.metrics.clone(),
        })
    }

    fn run_stage(
        &self,
        spec: &StageSpec,
        stage: &dyn Stage,
        secrets: &dyn SecretStore,
        run: &mut PipelineRun,
        ctx: &RunContext,
    ) -> Result<(), PipelineError> {
        let timeout = spec.timeout_secs.map(Duration::from_secs);
        if spec.credentials.is_empty() {
            let exec = StageExec {
                ctx,
                stage_name: spec.display_name(),
                credentials: None,
                timeout,
            };
            stage.run(run, &exec)
        } else {
            secrets::with_scope(secrets, &spec.credentials, |creds| {
                let exec = StageExec {
                    ctx,
                    stage_name: spec.display_name(),
                    credentials: Some(creds),
                    timeout,
                };
                stage.run(run, &exec)
            })?
        }
    }

    fn collect_artifacts(&self, ctx: &RunContext, run: &mut PipelineRun) {
        if self.workspace.artifacts.is_empty() {
            return;
        }
        let archive_dir = if self.workspace.archive_directory.is_absolute() {
            self.workspace.archive_directory.clone()
        } else {
            ctx.workdir.join(&self.workspace.archive_directory)
        };
        match archive::collect(
            &self.workspace.artifacts,
            &ctx.workdir,
            &archive_dir,
            run.build_id,
        ) {
            Ok(artifacts) => run.artifacts = artifacts,
            Err(err) => {
                warn!(error = %err, "Artifact collection failed");
                run.metadata.insert(
                    "artifacts.error".to_string(),
                    Value::String(err.to_string()),
                );
            }
        }
    }
}

/// Instantiate every stage of the definition against the registry and wire
/// up an executor for it.
pub fn build_pipeline(
    registry: &StageRegistry,
    definition: &PipelineDefinition,
) -> Result<PipelineExecutor, PipelineError> {
    let mut stages = Vec::with_capacity(definition.stages.len());
    for spec in &definition.stages {
        let params = spec.params.clone().unwrap_or_default();
        let stage = registry.create(&spec.stage, params)?;
        stages.push((spec.clone(), stage));
    }

    Ok(PipelineExecutor {
        pipeline: definition.name.clone(),
        parameters: definition.parameters.clone(),
        stages,
        workspace: definition.workspace.clone(),
        publish: definition.publish.clone(),
        metrics: MetricsCollector::new(),
    })
}
