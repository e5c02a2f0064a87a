use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use conveyor::definition::PipelineDefinition;
use conveyor::lockfile::generate_lock;
use conveyor::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use conveyor::observability::server::MetricsServer;
use conveyor::pipeline::{RunOptions, StageRegistry, build_pipeline};
use conveyor::presets::generate_preset;
use conveyor::secrets::{EnvStore, FileStore, SecretStore};
use conveyor::security::{compute_sha256, generate_sbom, write_sha256};
use conveyor::stages;
use conveyor::validation::validate_definition;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result: Result<()> = match cli.command {
        Commands::Run {
            pipeline,
            params,
            build_id,
            secrets,
            workdir,
            dry_run,
            report_json,
            print_metrics,
            metrics_json,
            metrics_prometheus,
            metrics_listen,
            otlp_endpoint,
        } => {
            let _ = otlp_endpoint; // already handled in tracing configuration
            run_pipeline(RunArgs {
                pipeline,
                params,
                build_id,
                secrets,
                workdir,
                dry_run,
                report_json,
                print_metrics,
                metrics_json,
                metrics_prometheus,
                metrics_listen,
            })
        }
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Validate { pipeline } => validate_cmd(pipeline),
        Commands::Lock { pipeline, output } => lock_cmd(pipeline, output),
        Commands::Pipeline { action } => pipeline_command(action),
        Commands::Security { action } => security_command(action),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "conveyor", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_trace_config(
                    sdktrace::Config::default()
                        .with_resource(Resource::new(vec![KeyValue::new(
                            "service.name",
                            "conveyor",
                        )])),
                )
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct RunArgs {
    pipeline: PathBuf,
    params: Vec<(String, String)>,
    build_id: Option<u64>,
    secrets: Option<PathBuf>,
    workdir: Option<PathBuf>,
    dry_run: bool,
    report_json: Option<PathBuf>,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    metrics_listen: Option<String>,
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let definition = PipelineDefinition::load(&args.pipeline)?;
    let registry = build_registry();

    let report = validate_definition(&definition, &registry);
    for warning in &report.warnings {
        warn!(file = %args.pipeline.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %args.pipeline.display(), "{error_msg}");
        }
        bail!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let executor = build_pipeline(&registry, &definition)?;

    if args.dry_run {
        info!(
            "Loaded pipeline '{}' with {} stage(s): {}",
            definition.name,
            definition.stages.len(),
            executor.stage_names().join(" -> ")
        );
        return Ok(());
    }

    let build_id = resolve_build_id(args.build_id)?;
    let overrides: BTreeMap<String, String> = args.params.into_iter().collect();

    let secrets: Box<dyn SecretStore> = match &args.secrets {
        Some(path) => Box::new(FileStore::load(path)?),
        None => Box::new(EnvStore::new()),
    };

    let metrics_handle = executor.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = args.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = args.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let options = RunOptions {
        build_id,
        overrides,
        workdir: args.workdir,
    };
    let run = executor.execute(secrets.as_ref(), &options);

    for outcome in &run.stages {
        info!(
            stage = %outcome.name,
            status = ?outcome.status,
            duration_ms = outcome.duration_ms,
            error = outcome.error.as_deref().unwrap_or(""),
            "Stage outcome"
        );
    }

    if let Some(path) = &args.report_json {
        ensure_parent_dir(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        to_writer_pretty(file, &run)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        info!(report = %path.display(), "Run report written");
    }

    if args.print_metrics || args.metrics_json.is_some() || args.metrics_prometheus.is_some() {
        let snapshot = metrics_handle.snapshot();
        if args.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = args.metrics_json {
            ensure_parent_dir(&path)?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = args.metrics_prometheus {
            ensure_parent_dir(&path)?;
            std::fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    if run.succeeded() {
        Ok(())
    } else {
        let failed_stage = run
            .stages
            .iter()
            .find(|outcome| outcome.error.is_some() && outcome.fatal)
            .map(|outcome| outcome.name.clone());
        match failed_stage {
            Some(stage) => bail!(
                "Run {} finished with status {:?} (failed at stage '{stage}')",
                run.build_id,
                run.status
            ),
            None => bail!("Run {} finished with status {:?}", run.build_id, run.status),
        }
    }
}

fn resolve_build_id(flag: Option<u64>) -> Result<u64> {
    if let Some(id) = flag {
        return Ok(id);
    }
    match std::env::var("CONVEYOR_BUILD_ID") {
        Ok(raw) => raw.trim().parse().with_context(|| {
            format!("CONVEYOR_BUILD_ID must be a non-negative integer, got '{raw}'")
        }),
        Err(_) => bail!(
            "No build identifier supplied. Pass --build-id or set CONVEYOR_BUILD_ID in the environment."
        ),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for kind in registry.known_stages() {
        println!("- {kind}");
    }
}

fn validate_cmd(pipeline_path: PathBuf) -> Result<()> {
    let definition = PipelineDefinition::load(&pipeline_path)?;
    let registry = build_registry();
    let report = validate_definition(&definition, &registry);

    for warning in &report.warnings {
        warn!(file = %pipeline_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %pipeline_path.display(), "Pipeline validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %pipeline_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_cmd(pipeline_path: PathBuf, output_path: PathBuf) -> Result<()> {
    let definition = PipelineDefinition::load(&pipeline_path)?;
    let registry = build_registry();
    let report = validate_definition(&definition, &registry);

    for warning in &report.warnings {
        warn!(file = %pipeline_path.display(), "{warning}");
    }

    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %pipeline_path.display(), "{error_msg}");
        }
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    ensure_parent_dir(&output_path)?;
    generate_lock(&definition, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn pipeline_command(command: PipelineCommands) -> Result<()> {
    match command {
        PipelineCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset pipeline generated"
            );
            Ok(())
        }
        PipelineCommands::Lint { pipelines } => lint_pipelines(&pipelines),
        PipelineCommands::Diff { lhs, rhs } => diff_pipelines(&lhs, &rhs),
    }
}

fn lint_pipelines(pipelines: &[PathBuf]) -> Result<()> {
    if pipelines.is_empty() {
        bail!("No pipeline files supplied for linting");
    }

    let registry = build_registry();
    let mut failures = 0usize;

    for path in pipelines {
        match PipelineDefinition::load(path) {
            Ok(definition) => {
                let report = validate_definition(&definition, &registry);
                for warning in &report.warnings {
                    warn!(file = %path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load pipeline: {err}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} pipeline(s)");
    }

    info!("All pipeline lint checks passed");
    Ok(())
}

fn diff_pipelines(lhs: &Path, rhs: &Path) -> Result<()> {
    let left = PipelineDefinition::load(lhs)?;
    let right = PipelineDefinition::load(rhs)?;

    let mut differences = Vec::new();

    if left.version != right.version {
        differences.push(format!(
            "Version mismatch: {} vs {}",
            left.version, right.version
        ));
    }

    if left.name != right.name {
        differences.push(format!("Name differs: '{}' vs '{}'", left.name, right.name));
    }

    let left_params: Vec<_> = left.parameters.iter().map(|p| p.name.clone()).collect();
    let right_params: Vec<_> = right.parameters.iter().map(|p| p.name.clone()).collect();
    if left_params != right_params {
        differences.push(format!(
            "Declared parameters differ: {:?} vs {:?}",
            left_params, right_params
        ));
    }

    let min_len = left.stages.len().min(right.stages.len());
    if left.stages.len() != right.stages.len() {
        differences.push(format!(
            "Stage count differs: {} vs {}",
            left.stages.len(),
            right.stages.len()
        ));
    }

    for (idx, (l_stage, r_stage)) in left
        .stages
        .iter()
        .take(min_len)
        .zip(right.stages.iter())
        .enumerate()
    {
        if l_stage.stage != r_stage.stage {
            differences.push(format!(
                "Stage {} kind differs: '{}' vs '{}'",
                idx + 1,
                l_stage.stage,
                r_stage.stage
            ));
        }
        if l_stage.fatal != r_stage.fatal || l_stage.always_run != r_stage.always_run {
            differences.push(format!(
                "Stage {} ('{}') policy differs: fatal {} vs {}, always_run {} vs {}",
                idx + 1,
                l_stage.display_name(),
                l_stage.fatal,
                r_stage.fatal,
                l_stage.always_run,
                r_stage.always_run
            ));
        }
        let l_params = l_stage.params.clone().unwrap_or_default();
        let r_params = r_stage.params.clone().unwrap_or_default();
        if l_params != r_params {
            differences.push(format!(
                "Stage {} ('{}') parameters differ: {} vs {}",
                idx + 1,
                l_stage.display_name(),
                serde_json::to_string(&l_params).unwrap_or_else(|_| "<invalid>".into()),
                serde_json::to_string(&r_params).unwrap_or_else(|_| "<invalid>".into())
            ));
        }
    }

    for (extra_idx, stage) in left.stages[min_len..].iter().enumerate() {
        differences.push(format!(
            "Extra stage in left pipeline at position {}: '{}'",
            min_len + extra_idx + 1,
            stage.display_name()
        ));
    }
    for (extra_idx, stage) in right.stages[min_len..].iter().enumerate() {
        differences.push(format!(
            "Extra stage in right pipeline at position {}: '{}'",
            min_len + extra_idx + 1,
            stage.display_name()
        ));
    }

    let left_publish = serde_json::to_value(&left.publish)?;
    let right_publish = serde_json::to_value(&right.publish)?;
    if left_publish != right_publish {
        differences.push(format!(
            "Publish coordinates differ: {} vs {}",
            serde_json::to_string(&left_publish).unwrap_or_else(|_| "<invalid>".into()),
            serde_json::to_string(&right_publish).unwrap_or_else(|_| "<invalid>".into())
        ));
    }

    if differences.is_empty() {
        println!("Pipelines match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Pipeline differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        bail!("Pipelines differ ({} difference(s) found)", differences.len());
    }
}

fn security_command(command: SecurityCommands) -> Result<()> {
    match command {
        SecurityCommands::Sbom { output } => {
            generate_sbom(&output)?;
            info!(sbom = %output.display(), "SBOM generated");
            Ok(())
        }
        SecurityCommands::Digest { path, output } => {
            if let Some(out_path) = output {
                let digest = write_sha256(&path, &out_path)?;
                println!("{}  {}", digest, path.display());
                info!(
                    file = %path.display(),
                    digest_output = %out_path.display(),
                    "SHA256 digest written"
                );
            } else {
                let digest = compute_sha256(&path)?;
                println!("{}  {}", digest, path.display());
                info!(file = %path.display(), "SHA256 computed");
            }
            Ok(())
        }
    }
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("'{raw}' must be of the form key=value")),
    }
}

#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Minimal continuous-delivery pipeline engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline definition to its terminal status.
    Run {
        pipeline: PathBuf,
        /// Run-time parameter overrides, repeatable: --param repo_name=demo
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Build identifier supplied by the invoking system.
        #[arg(long = "build-id")]
        build_id: Option<u64>,
        /// YAML secrets file; defaults to CONVEYOR_SECRET_* environment lookups.
        #[arg(long)]
        secrets: Option<PathBuf>,
        /// Working directory override for stage commands.
        #[arg(long)]
        workdir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        /// Write the serialized run record to this path.
        #[arg(long = "report-json")]
        report_json: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long = "metrics-listen")]
        metrics_listen: Option<String>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    ListStages,
    Validate {
        pipeline: PathBuf,
    },
    Lock {
        pipeline: PathBuf,
        output: PathBuf,
    },
    Pipeline {
        #[command(subcommand)]
        action: PipelineCommands,
    },
    Security {
        #[command(subcommand)]
        action: SecurityCommands,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PipelineCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}

#[derive(Subcommand)]
enum SecurityCommands {
    Sbom {
        #[arg(long)]
        output: PathBuf,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
