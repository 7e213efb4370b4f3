use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};
use ttl_deploy::artifact::{pack_to_file, unpack_archive};
use ttl_deploy::config::PipelineConfig;
use ttl_deploy::lifecycle::{CancelToken, Destroyer, PendingTeardowns, SlotLock};
use ttl_deploy::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use ttl_deploy::observability::server::MetricsServer;
use ttl_deploy::pipeline::{RunContext, RunStatus, StageKind, build_pipeline};
use ttl_deploy::plan::{generate_plan, write_plan};
use ttl_deploy::process::{ToolCommand, Vars};
use ttl_deploy::quality::{EvaluationReport, QualityGate, ScorerReport, perplexity};
use ttl_deploy::security::{compute_sha256, write_sha256};
use ttl_deploy::stages::default_registry;
use ttl_deploy::toolchain::Toolchain;
use ttl_deploy::validation::{check_run_id, validate_config};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let Cli {
        command,
        log_format,
    } = Cli::parse();

    let otlp_endpoint = match &command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };
    configure_tracing(log_format, otlp_endpoint.as_deref())?;

    let result = match command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Validate { config } => validate_cmd(&config),
        Commands::Plan { config, output } => plan_cmd(&config, &output),
        Commands::Destroy { config, slot } => destroy_cmd(&config, slot.as_deref()),
        Commands::Gate {
            report,
            threshold,
            output,
        } => gate_cmd(&report, threshold, output.as_deref()),
        Commands::Archive { action } => archive_cmd(action),
        Commands::Digest { path, output } => digest_cmd(&path, output.as_deref()),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result
}

fn configure_tracing(format: LogFormat, otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (text_layer, json_layer) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer);

    #[cfg(feature = "otel")]
    {
        let otel_layer = match otlp_endpoint {
            Some(endpoint) => {
                let tracer = opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "ttl-deploy")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;
                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            }
            None => None,
        };
        registry
            .with(otel_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
            );
        }
        registry
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn load_valid_config(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::load(path)?;
    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!("{warning}");
    }
    if !report.is_ok() {
        for err in &report.errors {
            error!("{err}");
        }
        bail!(
            "Configuration {} has {} error(s)",
            path.display(),
            report.errors.len()
        );
    }
    Ok(config)
}

fn resolve_commit(commit: Option<String>) -> Result<String> {
    if let Some(commit) = commit {
        return Ok(commit);
    }
    let output = ToolCommand::new("git", &["rev-parse", "HEAD"])
        .run(&Vars::new())
        .context("No --commit given and `git rev-parse HEAD` failed")?;
    let commit = output.stdout.trim().to_string();
    if commit.is_empty() {
        bail!("`git rev-parse HEAD` printed nothing; pass --commit");
    }
    Ok(commit)
}

/// Cancel the run on Ctrl-C. The listener lives on its own thread and runtime.
fn install_interrupt_handler(cancel: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(error = %err, "Interrupt handler unavailable");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                warn!("Interrupt received; cancelling run (teardown still runs)");
                cancel.cancel();
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Failed to spawn interrupt handler");
    }
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let config = Arc::new(load_valid_config(&args.config)?);
    let commit = resolve_commit(args.commit)?;
    let run_id = args
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    check_run_id(&run_id)?;

    let executor = build_pipeline(&default_registry(), &config)?;
    let metrics_handle = executor.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &args.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &args.metrics_listen {
        warn!("Metrics server feature not enabled; ignoring --metrics-listen={addr_str}.");
    }

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let toolchain = Toolchain::from_config(&config)?;
    let mut ctx = RunContext::new(&run_id, &commit, config.clone(), toolchain, cancel)?;
    let run = executor.execute(&mut ctx);
    drop(ctx);

    let record = run.write(&config.run.run_dir())?;
    info!(run_id = %run.run_id, record = %record.display(), status = ?run.status, "Run record written");

    let snapshot = metrics_handle.snapshot();
    if args.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &args.metrics_json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &args.metrics_prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    match run.status {
        RunStatus::Succeeded => Ok(()),
        status => {
            let detail = run
                .failure()
                .map(|stage| {
                    format!(
                        "{} failed with {}: {}",
                        stage.stage,
                        stage.error_code.as_deref().unwrap_or("unknown"),
                        stage.error.as_deref().unwrap_or_default()
                    )
                })
                .unwrap_or_else(|| "no stage failed".to_string());
            bail!("Run {} ended {:?}: {detail}", run.run_id, status)
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn validate_cmd(path: &Path) -> Result<()> {
    let config = PipelineConfig::load(path)?;
    let report = validate_config(&config);
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if report.is_ok() {
        println!("Configuration is valid");
        Ok(())
    } else {
        for err in &report.errors {
            println!("error: {err}");
        }
        bail!("Configuration has {} error(s)", report.errors.len())
    }
}

fn plan_cmd(config: &Path, output: &Path) -> Result<()> {
    let config = load_valid_config(config)?;
    let plan = generate_plan(&config)?;
    write_plan(&plan, output)?;
    info!(plan = %output.display(), stages = plan.stages.len(), "Plan written");
    Ok(())
}

fn destroy_cmd(config: &Path, slot_filter: Option<&str>) -> Result<()> {
    let config = PipelineConfig::load(config)?;
    let toolchain = Toolchain::from_config(&config)?;
    let destroyer = Destroyer::new(toolchain.cloud.clone(), toolchain.sleeper.clone(), &config.lifecycle);
    let records = PendingTeardowns::new(config.run.environment_dir());

    let pending: Vec<_> = records
        .list()?
        .into_iter()
        .filter(|env| slot_filter.is_none_or(|key| env.slot.key() == key))
        .collect();
    if pending.is_empty() {
        println!("No pending environments");
        return Ok(());
    }

    let mut failures = 0;
    for env in pending {
        match destroyer.teardown(&env) {
            Ok(report) => {
                records.remove(&env.slot)?;
                SlotLock::force_release(&config.run.lock_dir(), &env.slot)?;
                println!(
                    "{}: destroyed (service_deleted={}, identity_deleted={}, attempts={})",
                    env.slot, report.service_deleted, report.identity_deleted, report.attempts
                );
            }
            Err(err) => {
                failures += 1;
                error!(slot = %env.slot, error = %err, "Teardown failed");
                println!("{}: {}", env.slot, err);
            }
        }
    }
    if failures > 0 {
        bail!("{failures} environment(s) could not be destroyed");
    }
    Ok(())
}

fn gate_cmd(report: &Path, threshold: f64, output: Option<&Path>) -> Result<()> {
    let content = fs::read_to_string(report)
        .with_context(|| format!("Failed to read scorer report: {}", report.display()))?;
    let scorer: ScorerReport = serde_json::from_str(&content)
        .with_context(|| format!("Malformed scorer report: {}", report.display()))?;

    let gate = QualityGate::new(threshold)?;
    let ppl = perplexity(&scorer.sequences)?;
    let result = gate.evaluate(ppl.value);
    let summary = EvaluationReport::new(&ppl, &result, scorer.samples);

    let rendered = serde_json::to_string_pretty(&summary)?;
    println!("{rendered}");
    if let Some(path) = output {
        ensure_parent(path)?;
        fs::write(path, &rendered)
            .with_context(|| format!("Failed to write evaluation report: {}", path.display()))?;
    }
    result.into_decision()?;
    Ok(())
}

fn archive_cmd(action: ArchiveCommands) -> Result<()> {
    match action {
        ArchiveCommands::Pack { source, output } => {
            let digest = pack_to_file(&source, &output)?;
            println!("{digest}  {}", output.display());
        }
        ArchiveCommands::Unpack {
            archive,
            destination,
        } => {
            let data = fs::read(&archive)
                .with_context(|| format!("Failed to read archive: {}", archive.display()))?;
            unpack_archive(&data, &destination)?;
            println!("Extracted {} into {}", archive.display(), destination.display());
        }
    }
    Ok(())
}

fn digest_cmd(path: &Path, output: Option<&Path>) -> Result<()> {
    let digest = match output {
        Some(out) => write_sha256(path, out)?,
        None => compute_sha256(path)?,
    };
    println!("{digest}  {}", path.display());
    Ok(())
}

fn list_stages() {
    println!("Stages:");
    for kind in StageKind::ORDER {
        let prerequisites: Vec<&str> = kind.prerequisites().iter().map(|p| p.name()).collect();
        let suffix = if kind.is_cleanup() {
            " (cleanup: runs whenever an environment exists)"
        } else {
            ""
        };
        if prerequisites.is_empty() {
            println!("- {}{suffix}", kind.name());
        } else {
            println!("- {} <- {}{suffix}", kind.name(), prerequisites.join(", "));
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "ttl-deploy", version, about = "Train, gate, deploy and expire an ML service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long = "log-format", value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(clap::Args)]
struct RunArgs {
    config: PathBuf,
    /// Commit identifier used for image tags; defaults to `git rev-parse HEAD`.
    #[arg(long)]
    commit: Option<String>,
    #[arg(long = "run-id")]
    run_id: Option<String>,
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
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the full pipeline once.
    Run(RunArgs),
    Validate {
        config: PathBuf,
    },
    /// Write the stage plan with per-stage configuration digests.
    Plan {
        config: PathBuf,
        output: PathBuf,
    },
    /// Retry teardown of environments left behind by failed runs.
    Destroy {
        config: PathBuf,
        /// Only this slot key (`project--region--service`).
        #[arg(long)]
        slot: Option<String>,
    },
    /// Apply the quality gate to a scorer report.
    Gate {
        report: PathBuf,
        #[arg(long)]
        threshold: f64,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Archive {
        #[command(subcommand)]
        action: ArchiveCommands,
    },
    Digest {
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    ListStages,
}

#[derive(Subcommand)]
enum ArchiveCommands {
    Pack { source: PathBuf, output: PathBuf },
    Unpack { archive: PathBuf, destination: PathBuf },
}
