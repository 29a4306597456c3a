//! Sequential batch execution over a directory of scenario files

use crate::orchestrator::{ExperimentRun, Orchestrator, RunStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Terminal result of one scenario in a batch
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub scenario_id: String,
    pub source: PathBuf,
    pub status: RunStatus,
    pub error: Option<String>,
    pub result_dir: Option<PathBuf>,
}

impl ScenarioOutcome {
    fn from_run(source: &Path, run: ExperimentRun) -> Self {
        Self {
            scenario_id: run.scenario_id,
            source: source.to_path_buf(),
            status: run.status,
            error: run.error,
            result_dir: run.result_dir,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Done
    }
}

#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub outcomes: Vec<ScenarioOutcome>,
    /// Scenarios never started because the batch halted
    pub skipped: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }
}

/// Scenario files in `dir` with one of `extensions`, sorted by path
pub fn discover(dir: &Path, extensions: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)));
        if matches {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}

pub struct BatchRunner {
    orchestrator: Orchestrator,
    stop_on_error: bool,
}

impl BatchRunner {
    pub fn new(orchestrator: Orchestrator, stop_on_error: bool) -> Self {
        Self {
            orchestrator,
            stop_on_error,
        }
    }

    pub async fn run_dir(&self, dir: &Path, extensions: &[String]) -> std::io::Result<BatchSummary> {
        let paths = discover(dir, extensions)?;
        if paths.is_empty() {
            warn!("No scenario files found in {:?}", dir);
        }
        Ok(self.run_paths(paths).await)
    }

    /// Run scenarios one at a time in lexicographic order of their path
    pub async fn run_paths(&self, mut paths: Vec<PathBuf>) -> BatchSummary {
        paths.sort();
        info!("Running batch of {} scenario(s)", paths.len());

        let mut summary = BatchSummary::default();

        for (index, path) in paths.iter().enumerate() {
            if self.orchestrator.shutdown_requested() {
                warn!("Shutdown requested, not starting remaining scenarios");
                summary.skipped = paths.len() - index;
                break;
            }

            info!("[{}/{}] {:?}", index + 1, paths.len(), path);
            let run = self.orchestrator.run_file(path).await;
            let outcome = ScenarioOutcome::from_run(path, run);
            let failed = !outcome.succeeded();

            info!("{}: {}", outcome.scenario_id, outcome.status);
            summary.outcomes.push(outcome);

            if failed && self.stop_on_error {
                warn!("Stopping batch after failure (stop_on_error)");
                summary.skipped = paths.len() - index - 1;
                break;
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::RunOptions;
    use crate::shaping::SimulatedShaper;
    use crate::storage::MetricsStore;
    use std::fs;
    use std::sync::Arc;

    fn write_batch(dir: &Path) {
        fs::write(dir.join("good.yaml"), "delay_ms: 20\n").unwrap();
        fs::write(dir.join("bad.yaml"), "delay_ms: 20\nloss_pct: 150\n").unwrap();

        for (file, profile) in [("a.yaml", "good"), ("b.yaml", "bad"), ("c.yml", "good")] {
            let id = file.split('.').next().unwrap();
            let contents = format!(
                "id: exp_{}\nprotocol: dash\nmpd_url: http://SERVER_PUBLIC_IP/m.mpd\n\
                 network_profile:\n  type: static\n  file: ../{}.yaml\n\
                 experiment:\n  duration_s: 10\n",
                id, profile
            );
            fs::write(dir.join("scenarios").join(file), contents).unwrap();
        }
        fs::write(dir.join("scenarios").join("notes.txt"), "not a scenario").unwrap();
    }

    fn runner(dir: &Path, stop_on_error: bool) -> BatchRunner {
        let options = RunOptions {
            results_dir: dir.join("results"),
            interface: "veth-test".to_string(),
            server_address: "127.0.0.1".to_string(),
            stats_port: 8000,
            player_url: "file://player.html".to_string(),
            skip_network: false,
            skip_export: false,
        };
        let orchestrator = Orchestrator::new(
            Arc::new(SimulatedShaper::new()),
            Arc::new(MetricsStore::open_in_memory().unwrap()),
            options,
        );
        BatchRunner::new(orchestrator, stop_on_error)
    }

    fn extensions() -> Vec<String> {
        vec!["yaml".to_string(), "yml".to_string()]
    }

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("scenarios")).unwrap();
        write_batch(dir.path());
        dir
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let dir = setup();
        let found = discover(&dir.path().join("scenarios"), &extensions()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.yaml", "b.yaml", "c.yml"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_continues_after_failure() {
        let dir = setup();
        let summary = runner(dir.path(), false)
            .run_dir(&dir.path().join("scenarios"), &extensions())
            .await
            .unwrap();

        let statuses: Vec<(String, RunStatus)> = summary
            .outcomes
            .iter()
            .map(|o| (o.scenario_id.clone(), o.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("exp_a".to_string(), RunStatus::Done),
                ("b".to_string(), RunStatus::Failed),
                ("exp_c".to_string(), RunStatus::Done),
            ]
        );
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_stops_on_error() {
        let dir = setup();
        let summary = runner(dir.path(), true)
            .run_dir(&dir.path().join("scenarios"), &extensions())
            .await
            .unwrap();

        assert_eq!(summary.total(), 2);
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.outcomes[1].error.as_deref().unwrap().contains("loss_pct"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_paths_sorts_input() {
        let dir = setup();
        let scenarios = dir.path().join("scenarios");
        let summary = runner(dir.path(), false)
            .run_paths(vec![scenarios.join("c.yml"), scenarios.join("a.yaml")])
            .await;

        let ids: Vec<&str> = summary.outcomes.iter().map(|o| o.scenario_id.as_str()).collect();
        assert_eq!(ids, vec!["exp_a", "exp_c"]);
    }
}
