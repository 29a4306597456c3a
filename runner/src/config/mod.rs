//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides the shaping interface
pub const INTERFACE_ENV: &str = "CLIENT_IF";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub shaping: ShapingConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Substituted for the placeholder in scenario media URLs
    #[serde(default = "default_server_address")]
    pub server_address: String,
    #[serde(default = "default_stats_port")]
    pub stats_port: u16,
    /// Base URL of the session player page
    #[serde(default = "default_player_url")]
    pub player_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapingBackend {
    /// Kernel shaping through `tc qdisc`/`netem`
    Tc,
    /// In-memory shaper, for dry runs without privileges
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShapingConfig {
    #[serde(default)]
    pub interface: String,
    #[serde(default = "default_backend")]
    pub backend: ShapingBackend,
    #[serde(default = "default_tc_path")]
    pub tc_path: String,
    #[serde(default)]
    pub use_sudo: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// Control-condition runs: leave the interface untouched
    #[serde(default)]
    pub skip_network: bool,
    #[serde(default)]
    pub skip_export: bool,
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default = "default_scenario_extensions")]
    pub scenario_extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthConfig {
    /// `host:port` endpoints that must accept TCP connections before a run
    #[serde(default)]
    pub required_services: Vec<String>,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("experiments/results")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("testbed.db")
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}

fn default_stats_port() -> u16 {
    8000
}

fn default_player_url() -> String {
    "file://protocol_integration/dash/client_examples/dash_player.html".to_string()
}

fn default_backend() -> ShapingBackend {
    ShapingBackend::Tc
}

fn default_tc_path() -> String {
    "tc".to_string()
}

fn default_scenario_extensions() -> Vec<String> {
    vec!["yaml".to_string(), "yml".to_string()]
}

fn default_health_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            database_path: default_database_path(),
            server_address: default_server_address(),
            stats_port: default_stats_port(),
            player_url: default_player_url(),
        }
    }
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            backend: default_backend(),
            tc_path: default_tc_path(),
            use_sudo: false,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            skip_network: false,
            skip_export: false,
            stop_on_error: false,
            scenario_extensions: default_scenario_extensions(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| "Failed to parse config file")?;

        config.apply_env(std::env::var(INTERFACE_ENV).ok());

        Ok(config)
    }

    /// Load `path` if it exists, fall back to defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.apply_env(std::env::var(INTERFACE_ENV).ok());
            Ok(config)
        }
    }

    fn apply_env(&mut self, interface: Option<String>) {
        if let Some(interface) = interface.filter(|i| !i.trim().is_empty()) {
            self.shaping.interface = interface;
        }
    }
}
