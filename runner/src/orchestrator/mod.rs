//! Experiment orchestration
//!
//! One run walks PENDING → NETWORK_APPLIED → RUNNING → EXPORTED → DONE, or
//! drops to FAILED at any step. Whatever shaping state the network step
//! acquires is released on every exit path.

pub mod health;

pub use health::{AlwaysReady, HealthCheck, PreconditionError, ServiceProbe};

use crate::config::Config;
use crate::shaping::{Shaper, ShapingError};
use crate::storage::MetricsStore;
use crate::trace::{SchedulerState, TraceHandle, TraceScheduler};
use chrono::{DateTime, Local, Utc};
use model::{
    LOGS_DIR, METRICS_EXPORT_FILE, NetworkProfile, ORCHESTRATOR_LOG_FILE, ProfileKind,
    RUN_ID_TIMESTAMP_FORMAT, RUN_RECORD_FILE, SCENARIO_SNAPSHOT_FILE, STATIC_PROFILE_SNAPSHOT_FILE,
    STATS_DIR, Scenario, TRACE_SNAPSHOT_FILE, ValidationError,
};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    NetworkApplied,
    Running,
    Exported,
    Done,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::NetworkApplied => "NETWORK_APPLIED",
            RunStatus::Running => "RUNNING",
            RunStatus::Exported => "EXPORTED",
            RunStatus::Done => "DONE",
            RunStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Invalid scenario: {0}")]
    Validation(#[from] ValidationError),

    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("No shaping interface configured")]
    NoInterface,

    #[error("Network setup failed: {0}")]
    Shaping(#[from] ShapingError),

    #[error("Failed to prepare result directory {path:?}: {source}")]
    ResultDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write scenario snapshot: {0}")]
    Snapshot(String),

    #[error("Interrupted")]
    Interrupted,
}

/// Record of one scenario execution, persisted as `run.json`
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRun {
    pub run_id: String,
    pub scenario_id: String,
    pub protocol: Option<String>,
    pub profile_kind: Option<ProfileKind>,
    pub result_dir: Option<PathBuf>,
    pub status: RunStatus,
    /// Cause of a FAILED run
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub media_url: Option<String>,
    pub player_url: Option<String>,
    pub exported_events: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExperimentRun {
    fn new(scenario_id: &str) -> Self {
        Self {
            run_id: format!("{}_{}", scenario_id, Local::now().format(RUN_ID_TIMESTAMP_FORMAT)),
            scenario_id: scenario_id.to_string(),
            protocol: None,
            profile_kind: None,
            result_dir: None,
            status: RunStatus::Pending,
            error: None,
            warnings: Vec::new(),
            media_url: None,
            player_url: None,
            exported_events: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A scenario file that could not even be loaded
    pub fn load_failure(scenario_id: &str, error: &ValidationError) -> Self {
        let mut run = Self::new(scenario_id);
        run.status = RunStatus::Failed;
        run.error = Some(format!("Invalid scenario: {}", error));
        run.finished_at = Some(Utc::now());
        run
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Done
    }
}

/// Per-run settings resolved from configuration and CLI overrides
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub results_dir: PathBuf,
    pub interface: String,
    pub server_address: String,
    pub stats_port: u16,
    pub player_url: String,
    pub skip_network: bool,
    pub skip_export: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            results_dir: config.general.results_dir.clone(),
            interface: config.shaping.interface.clone(),
            server_address: config.general.server_address.clone(),
            stats_port: config.general.stats_port,
            player_url: config.general.player_url.clone(),
            skip_network: config.experiment.skip_network,
            skip_export: config.experiment.skip_export,
        }
    }
}

/// Shaping state acquired by the network step
enum Network {
    Untouched,
    Static,
    Trace(TraceHandle),
}

enum WaitOutcome {
    Elapsed,
    Interrupted,
    ReplayFailed,
}

/// Append-only stage journal in `logs/orchestrator.log`
struct Journal {
    file: Option<File>,
}

impl Journal {
    fn disabled() -> Self {
        Self { file: None }
    }

    fn open(path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self { file: Some(file) },
            Err(e) => {
                warn!("Cannot open run journal {:?}: {}", path, e);
                Self::disabled()
            }
        }
    }

    fn record(&mut self, status: RunStatus, message: &str) {
        if let Some(file) = &mut self.file {
            let line = format!("{} {:<15} {}\n", Utc::now().to_rfc3339(), status, message);
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("Failed to write run journal: {}", e);
                self.file = None;
            }
        }
    }
}

pub struct Orchestrator {
    shaper: Arc<dyn Shaper>,
    store: Arc<MetricsStore>,
    health: Box<dyn HealthCheck>,
    options: RunOptions,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(shaper: Arc<dyn Shaper>, store: Arc<MetricsStore>, options: RunOptions) -> Self {
        Self {
            shaper,
            store,
            health: Box::new(AlwaysReady),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_health(mut self, health: Box<dyn HealthCheck>) -> Self {
        self.health = health;
        self
    }

    /// Token that interrupts the duration wait when cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Load a scenario file and run it. A file that fails to load yields a
    /// FAILED run named after the file stem.
    pub async fn run_file(&self, path: &Path) -> ExperimentRun {
        match Scenario::load(path) {
            Ok(scenario) => self.run(&scenario).await,
            Err(e) => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                error!("Failed to load scenario {:?}: {}", path, e);
                ExperimentRun::load_failure(&stem, &e)
            }
        }
    }

    pub async fn run(&self, scenario: &Scenario) -> ExperimentRun {
        let mut run = ExperimentRun::new(&scenario.id);
        run.protocol = Some(scenario.protocol.to_string());
        run.profile_kind = Some(scenario.network_profile.kind());

        info!("=== Experiment {} ({}) ===", scenario.id, run.run_id);

        // Pre-flight: nothing touched yet
        if let Err(e) = self.preflight(scenario) {
            return self.finish_failed(run, &mut Journal::disabled(), e);
        }

        let result_dir = match self.prepare_result_dir(&run.run_id) {
            Ok(dir) => dir,
            Err(e) => return self.finish_failed(run, &mut Journal::disabled(), e),
        };
        run.result_dir = Some(result_dir.clone());

        let mut journal = Journal::open(&result_dir.join(LOGS_DIR).join(ORCHESTRATOR_LOG_FILE));
        journal.record(RunStatus::Pending, &format!("run {} for scenario {}", run.run_id, scenario.id));

        if let Err(e) = write_snapshot(scenario, &result_dir) {
            return self.finish_failed(run, &mut journal, e);
        }

        let media_url = scenario.resolve_media_url(&self.options.server_address);
        let player_url = scenario.player_url(
            &self.options.player_url,
            &self.options.server_address,
            self.options.stats_port,
        );
        info!("Media URL: {}", media_url);
        info!("Open the player with: {}", player_url);
        run.media_url = Some(media_url);
        run.player_url = Some(player_url);

        let mut network = match self.acquire_network(scenario) {
            Ok(network) => network,
            Err(e) => {
                self.best_effort_reset();
                return self.finish_failed(run, &mut journal, e);
            }
        };
        run.status = RunStatus::NetworkApplied;
        journal.record(run.status, &describe_network(scenario, &network));

        run.status = RunStatus::Running;
        journal.record(run.status, &format!("waiting {}s", scenario.duration_s));
        info!("Running for {}s", scenario.duration_s);

        let outcome = tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(scenario.duration_s)) => WaitOutcome::Elapsed,
            _ = self.shutdown.cancelled() => WaitOutcome::Interrupted,
            _ = replay_failed(&mut network) => WaitOutcome::ReplayFailed,
        };

        let released = self.release_network(network, &mut run).await;

        match outcome {
            WaitOutcome::Interrupted => {
                return self.finish_failed(run, &mut journal, OrchestrationError::Interrupted);
            }
            WaitOutcome::ReplayFailed | WaitOutcome::Elapsed => {
                if let Err(e) = released {
                    return self.finish_failed(run, &mut journal, e.into());
                }
            }
        }

        if self.options.skip_export {
            info!("Skipping metrics export");
        } else {
            let target = result_dir.join(STATS_DIR).join(METRICS_EXPORT_FILE);
            match self.store.export_to_path(&scenario.id, &target) {
                Ok(count) => {
                    run.exported_events = Some(count);
                    run.status = RunStatus::Exported;
                    journal.record(run.status, &format!("{} events -> {:?}", count, target));
                }
                Err(e) => {
                    warn!("Metrics export failed for {}: {}", scenario.id, e);
                    run.warnings.push(format!("metrics export failed: {}", e));
                }
            }
        }

        run.status = RunStatus::Done;
        run.finished_at = Some(Utc::now());
        journal.record(run.status, "experiment complete");
        info!("Experiment {} complete", scenario.id);

        persist_run(&run);
        run
    }

    fn preflight(&self, scenario: &Scenario) -> Result<(), OrchestrationError> {
        scenario.validate()?;

        if !self.options.skip_network && self.options.interface.trim().is_empty() {
            return Err(OrchestrationError::NoInterface);
        }

        self.health.check()?;
        Ok(())
    }

    /// Create `<results_dir>/<run_id>/` with its `stats/` and `logs/`
    /// subdirectories. A clashing run id gets a numeric suffix.
    fn prepare_result_dir(&self, run_id: &str) -> Result<PathBuf, OrchestrationError> {
        let dir_error = |path: &Path, source: std::io::Error| OrchestrationError::ResultDir {
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&self.options.results_dir)
            .map_err(|e| dir_error(self.options.results_dir.as_path(), e))?;

        let mut dir = self.options.results_dir.join(run_id);
        let mut suffix = 1;
        loop {
            match fs::create_dir(&dir) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    dir = self.options.results_dir.join(format!("{}_{}", run_id, suffix));
                }
                Err(e) => return Err(dir_error(dir.as_path(), e)),
            }
        }

        for sub in [STATS_DIR, LOGS_DIR] {
            let path = dir.join(sub);
            fs::create_dir(&path).map_err(|e| dir_error(path.as_path(), e))?;
        }

        info!("Results directory: {:?}", dir);
        Ok(dir)
    }

    fn acquire_network(&self, scenario: &Scenario) -> Result<Network, OrchestrationError> {
        if self.options.skip_network {
            info!("Skipping network configuration");
            return Ok(Network::Untouched);
        }

        let interface = &self.options.interface;
        match &scenario.network_profile {
            NetworkProfile::Static(params) => {
                self.shaper.apply(interface, params)?;
                info!("Applied static profile to {}: {}", interface, params);
                Ok(Network::Static)
            }
            NetworkProfile::Trace(trace) => {
                let handle = TraceScheduler::new(self.shaper.clone(), interface.as_str())
                    .start(trace.clone())?;
                info!(
                    "Started trace replay on {} ({} segments, {}ms)",
                    interface,
                    trace.len(),
                    trace.duration_ms()
                );
                Ok(Network::Trace(handle))
            }
        }
    }

    /// Undo the network step. Reset failures after a healthy run are kept
    /// as warnings; a trace replay that failed mid-run is returned.
    async fn release_network(&self, network: Network, run: &mut ExperimentRun) -> Result<(), ShapingError> {
        match network {
            Network::Untouched => Ok(()),
            Network::Static => {
                if let Err(e) = self.shaper.reset(&self.options.interface) {
                    warn!("Failed to reset {}: {}", self.options.interface, e);
                    run.warnings.push(format!("network reset failed: {}", e));
                }
                Ok(())
            }
            Network::Trace(handle) => {
                let replay_failed = handle.state() == SchedulerState::Failed;
                match handle.stop().await {
                    Ok(state) => {
                        debug!("Trace replay released in state {:?}", state);
                        Ok(())
                    }
                    Err(e) if replay_failed => {
                        self.best_effort_reset();
                        Err(e)
                    }
                    Err(e) => {
                        warn!("Failed to release trace replay: {}", e);
                        run.warnings.push(format!("network reset failed: {}", e));
                        Ok(())
                    }
                }
            }
        }
    }

    fn best_effort_reset(&self) {
        if self.options.skip_network || self.options.interface.is_empty() {
            return;
        }
        if let Err(e) = self.shaper.reset(&self.options.interface) {
            warn!("Best-effort reset of {} failed: {}", self.options.interface, e);
        }
    }

    fn finish_failed(
        &self,
        mut run: ExperimentRun,
        journal: &mut Journal,
        error: OrchestrationError,
    ) -> ExperimentRun {
        error!("Experiment {} failed: {}", run.scenario_id, error);

        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.finished_at = Some(Utc::now());
        journal.record(run.status, &error.to_string());

        persist_run(&run);
        run
    }
}

/// Resolves once a running trace replay has failed; pending otherwise
async fn replay_failed(network: &mut Network) {
    if let Network::Trace(handle) = network {
        if handle.settled().await == SchedulerState::Failed {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn describe_network(scenario: &Scenario, network: &Network) -> String {
    match (network, &scenario.network_profile) {
        (Network::Untouched, _) => "network untouched".to_string(),
        (_, NetworkProfile::Static(params)) => format!("static {}", params),
        (_, NetworkProfile::Trace(trace)) => format!("trace replay, {} segments", trace.len()),
    }
}

/// Copy the scenario and its profile file into the result directory
fn write_snapshot(scenario: &Scenario, result_dir: &Path) -> Result<(), OrchestrationError> {
    let copied_profile = match &scenario.profile_source {
        Some(source) => {
            let name = match scenario.network_profile.kind() {
                ProfileKind::Static => STATIC_PROFILE_SNAPSHOT_FILE,
                ProfileKind::Trace => TRACE_SNAPSHOT_FILE,
            };
            fs::copy(source, result_dir.join(name))
                .map_err(|e| OrchestrationError::Snapshot(e.to_string()))?;
            Some(PathBuf::from(name))
        }
        None => None,
    };

    let yaml = scenario
        .snapshot_yaml(copied_profile.as_deref())
        .map_err(|e| OrchestrationError::Snapshot(e.to_string()))?;
    fs::write(result_dir.join(SCENARIO_SNAPSHOT_FILE), yaml)
        .map_err(|e| OrchestrationError::Snapshot(e.to_string()))?;

    Ok(())
}

fn persist_run(run: &ExperimentRun) {
    let Some(dir) = &run.result_dir else {
        return;
    };

    let path = dir.join(RUN_RECORD_FILE);
    let written = serde_json::to_string_pretty(run)
        .map_err(|e| e.to_string())
        .and_then(|json| fs::write(&path, json).map_err(|e| e.to_string()));

    if let Err(e) = written {
        warn!("Failed to write run record {:?}: {}", path, e);
    }
}
