//! Testbed - network profile control and experiment orchestration
//!
//! Applies static or time-varying network conditions to an interface, runs
//! streaming experiments under them and collects client metrics per run.

mod batch;
mod config;
mod orchestrator;
mod output;
mod shaping;
mod storage;
mod trace;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, ShapingBackend};
use model::{NetworkProfile, ProfileKind, ShapingParams, Trace};
use orchestrator::{Orchestrator, RunOptions, ServiceProbe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{EventFilter, MetricsStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use trace::{SchedulerState, TraceScheduler};

const DEFAULT_CONFIG: &str = "testbed.conf";

#[derive(Parser, Debug)]
#[command(name = "testbed")]
#[command(version)]
#[command(about = "Network profile control and experiment orchestration", long_about = None)]
struct Args {
    /// Configuration file path (default: testbed.conf if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Network interface to shape (overrides config and CLIENT_IF)
    #[arg(long, global = true)]
    interface: Option<String>,

    /// Address substituted for SERVER_PUBLIC_IP in media URLs
    #[arg(long, global = true)]
    server_address: Option<String>,

    /// Leave the network untouched (control runs)
    #[arg(long, global = true)]
    skip_network: bool,

    /// Do not export metrics at the end of a run
    #[arg(long, global = true)]
    skip_export: bool,

    /// Use the in-memory shaper instead of tc
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one scenario file
    Run { scenario: PathBuf },

    /// Run every scenario file in a directory
    Batch {
        dir: PathBuf,

        /// Halt at the first failed scenario
        #[arg(long)]
        stop_on_error: bool,
    },

    /// Apply a static profile to the interface
    Apply {
        #[arg(required_unless_present = "reset")]
        profile: Option<PathBuf>,

        /// Restore passthrough instead
        #[arg(long, conflicts_with = "profile")]
        reset: bool,
    },

    /// Replay a trace in real time until Ctrl+C
    Replay {
        trace: PathBuf,

        /// Start this far into the trace
        #[arg(long, default_value_t = 0)]
        start_offset_ms: u64,
    },

    /// Check a trace file and report problems
    ValidateTrace { trace: PathBuf },

    /// Store metric records from a JSON array or JSON-lines file
    Ingest { file: PathBuf },

    /// Export stored metrics of one experiment
    Export {
        experiment_id: String,

        #[arg(long)]
        event_type: Option<String>,

        /// Inclusive lower bound (Unix seconds)
        #[arg(long)]
        start_time: Option<f64>,

        /// Inclusive upper bound (Unix seconds)
        #[arg(long)]
        end_time: Option<f64>,

        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Output file (JSON defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExportFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Testbed v{}", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Command::Run { scenario } => run_scenario(&config, scenario).await,
        Command::Batch { dir, stop_on_error } => {
            run_batch(&config, dir, *stop_on_error || config.experiment.stop_on_error).await
        }
        Command::Apply { profile, reset } => run_apply(&config, profile.as_deref(), *reset),
        Command::Replay {
            trace,
            start_offset_ms,
        } => run_replay(&config, trace, *start_offset_ms).await,
        Command::ValidateTrace { trace } => run_validate_trace(trace),
        Command::Ingest { file } => run_ingest(&config, file),
        Command::Export {
            experiment_id,
            event_type,
            start_time,
            end_time,
            format,
            output,
        } => {
            let filter = EventFilter {
                event_type: event_type.clone(),
                start_time: *start_time,
                end_time: *end_time,
            };
            run_export(&config, experiment_id, &filter, *format, output.as_deref())
        }
    }
}

/// File (or defaults) with command-line overrides applied
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(DEFAULT_CONFIG)?,
    };

    if let Some(interface) = &args.interface {
        config.shaping.interface = interface.clone();
    }
    if let Some(address) = &args.server_address {
        config.general.server_address = address.clone();
    }
    if args.simulate {
        config.shaping.backend = ShapingBackend::Simulated;
    }
    config.experiment.skip_network |= args.skip_network;
    config.experiment.skip_export |= args.skip_export;

    Ok(config)
}

fn require_interface(config: &Config) -> Result<&str> {
    let interface = config.shaping.interface.trim();
    if interface.is_empty() {
        bail!("No interface configured: set [shaping] interface, CLIENT_IF or --interface");
    }
    Ok(interface)
}

fn open_store(config: &Config) -> Result<Arc<MetricsStore>> {
    let store = MetricsStore::open(&config.general.database_path)
        .with_context(|| format!("Failed to open metrics store {:?}", config.general.database_path))?;
    Ok(Arc::new(store))
}

/// Orchestrator whose duration wait is interrupted by Ctrl+C
fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cleaning up");
            trigger.cancel();
        }
    });

    Ok(Orchestrator::new(
        shaping::from_config(&config.shaping),
        open_store(config)?,
        RunOptions::from_config(config),
    )
    .with_health(Box::new(ServiceProbe::from_config(&config.health)))
    .with_shutdown(shutdown))
}

async fn run_scenario(config: &Config, path: &Path) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let run = orchestrator.run_file(path).await;

    output::print_run(&run);

    if !run.succeeded() {
        bail!("Experiment {} failed", run.scenario_id);
    }
    Ok(())
}

async fn run_batch(config: &Config, dir: &Path, stop_on_error: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let runner = batch::BatchRunner::new(orchestrator, stop_on_error);

    let summary = runner
        .run_dir(dir, &config.experiment.scenario_extensions)
        .await
        .with_context(|| format!("Failed to read scenario directory {:?}", dir))?;

    output::print_batch_summary(&summary);

    if summary.failed() > 0 {
        bail!("{} of {} scenario(s) failed", summary.failed(), summary.total());
    }
    Ok(())
}

fn run_apply(config: &Config, profile: Option<&Path>, reset: bool) -> Result<()> {
    let interface = require_interface(config)?;
    let shaper = shaping::from_config(&config.shaping);

    let params = if reset {
        ShapingParams::PASSTHROUGH
    } else {
        let path = profile.context("A profile file is required unless --reset is given")?;
        match NetworkProfile::load(ProfileKind::Static, path)? {
            NetworkProfile::Static(params) => params,
            NetworkProfile::Trace(_) => bail!("{:?} is not a static profile", path),
        }
    };

    shaper
        .apply(interface, &params)
        .with_context(|| format!("Failed to apply profile to {}", interface))?;

    info!("Applied to {}: {}", interface, params);
    Ok(())
}

async fn run_replay(config: &Config, path: &Path, start_offset_ms: u64) -> Result<()> {
    let interface = require_interface(config)?;
    let trace = Trace::load(path)?;
    info!(
        "Loaded trace {:?}: {} segments over {}ms",
        path,
        trace.len(),
        trace.duration_ms()
    );

    let now = tokio::time::Instant::now();
    let t0 = now
        .checked_sub(Duration::from_millis(start_offset_ms))
        .unwrap_or(now);

    let shaper = shaping::from_config(&config.shaping);
    let mut handle = TraceScheduler::new(shaper, interface)
        .start_at(trace, t0)
        .with_context(|| format!("Failed to start replay on {}", interface))?;

    info!("Replaying on {} (Ctrl+C to stop)", interface);

    tokio::select! {
        state = handle.settled() => {
            if state == SchedulerState::Completed {
                info!("Trace complete, holding final segment until Ctrl+C");
                tokio::signal::ctrl_c().await?;
            }
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted");
        }
    }

    let state = handle.stop().await.context("Trace replay failed")?;
    info!("Replay ended ({:?}), {} restored to passthrough", state, interface);
    Ok(())
}

fn run_validate_trace(path: &Path) -> Result<()> {
    match Trace::load(path) {
        Ok(trace) => {
            println!("✓ {}", path.display());
            println!("  Segments: {}", trace.len());
            println!("  Duration: {}ms", trace.duration_ms());
            for warning in trace.warnings() {
                println!("  Warning: {}", warning);
            }
            Ok(())
        }
        Err(e) => {
            println!("✗ {}", path.display());
            println!("  Error: {}", e);
            bail!("Trace validation failed");
        }
    }
}

fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    let store = open_store(config)?;
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;

    let report = store
        .import(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to ingest {:?}", path))?;

    info!("Stored {} record(s) from {:?}", report.stored, path);
    for (record, reason) in &report.rejected {
        error!("Record {} rejected: {}", record, reason);
    }

    if !report.rejected.is_empty() {
        bail!("{} record(s) rejected", report.rejected.len());
    }
    Ok(())
}

fn run_export(
    config: &Config,
    experiment_id: &str,
    filter: &EventFilter,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let store = open_store(config)?;
    let events = store.query(experiment_id, filter)?;
    info!("Found {} events for {}", events.len(), experiment_id);

    match format {
        ExportFormat::Json => {
            let json = serde_json::to_string_pretty(&events)?;
            match output {
                Some(path) => {
                    std::fs::write(path, json + "\n")
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    info!("Exported to {:?}", path);
                }
                None => println!("{}", json),
            }
        }
        ExportFormat::Csv => {
            let path = output
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(format!("{}_metrics.csv", experiment_id)));
            output::export_csv(&events, &path)?;
            info!("Exported to {:?}", path);
        }
    }

    Ok(())
}
