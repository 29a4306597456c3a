//! Traffic shaping primitives
//!
//! Everything above this module talks to a [`Shaper`]; whether that is the
//! kernel (`tc`/`netem`) or the in-memory simulator is decided once from the
//! configuration.

mod simulated;
mod tc;

pub use simulated::SimulatedShaper;
pub use tc::TcShaper;

use crate::config::{ShapingBackend, ShapingConfig};
use model::ShapingParams;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShapingError {
    #[error("Failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Shaping unavailable on {interface}: {reason}")]
    Unavailable { interface: String, reason: String },

    #[error("Trace replay task ended abnormally: {0}")]
    ReplayAborted(String),
}

/// Capability to enforce link conditions on a network interface.
///
/// `apply` must replace whatever was installed before, so calling it twice
/// with the same parameters is indistinguishable from calling it once. On
/// error the interface state is undefined; implementations never retry.
pub trait Shaper: Send + Sync {
    fn apply(&self, interface: &str, params: &ShapingParams) -> Result<(), ShapingError>;

    /// Return the interface to passthrough (zero delay, no loss, no limit)
    fn reset(&self, interface: &str) -> Result<(), ShapingError> {
        self.apply(interface, &ShapingParams::PASSTHROUGH)
    }
}

/// Build the configured shaping backend
pub fn from_config(config: &ShapingConfig) -> Arc<dyn Shaper> {
    match config.backend {
        ShapingBackend::Tc => Arc::new(TcShaper::new(config.tc_path.clone(), config.use_sudo)),
        ShapingBackend::Simulated => Arc::new(SimulatedShaper::new()),
    }
}
