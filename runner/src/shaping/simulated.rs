//! In-memory shaper
//!
//! Keeps the parameters "installed" per interface and a log of every
//! application. Used for dry runs (`backend = "simulated"`) and by tests.

use super::{Shaper, ShapingError};
use model::ShapingParams;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::info;

/// One recorded `apply` call
#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub interface: String,
    pub params: ShapingParams,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct State {
    installed: HashMap<String, ShapingParams>,
    history: Vec<Application>,
}

#[derive(Debug, Default)]
pub struct SimulatedShaper {
    state: Mutex<State>,
    failing: AtomicBool,
}

impl SimulatedShaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail, as if the primitive were missing
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Parameters currently installed on `interface`
    pub fn current(&self, interface: &str) -> Option<ShapingParams> {
        self.lock().installed.get(interface).copied()
    }

    pub fn history(&self) -> Vec<Application> {
        self.lock().history.clone()
    }

    pub fn apply_count(&self) -> usize {
        self.lock().history.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shaper for SimulatedShaper {
    fn apply(&self, interface: &str, params: &ShapingParams) -> Result<(), ShapingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ShapingError::Unavailable {
                interface: interface.to_string(),
                reason: "simulated failure".to_string(),
            });
        }

        let mut state = self.lock();
        state.installed.insert(interface.to_string(), *params);
        state.history.push(Application {
            interface: interface.to_string(),
            params: *params,
            at: Instant::now(),
        });

        info!("[simulated] {} -> {}", interface, params);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_idempotent() {
        let shaper = SimulatedShaper::new();
        let params = ShapingParams::new(30.0, 5.0, 0.5, Some(8.0));

        shaper.apply("eth0", &params).unwrap();
        let once = shaper.current("eth0");
        shaper.apply("eth0", &params).unwrap();

        assert_eq!(shaper.current("eth0"), once);
        assert_eq!(shaper.current("eth0"), Some(params));
    }

    #[test]
    fn test_reset_then_apply_equals_apply() {
        let params = ShapingParams::new(120.0, 0.0, 2.0, None);

        let direct = SimulatedShaper::new();
        direct.apply("eth0", &ShapingParams::with_delay(500.0)).unwrap();
        direct.apply("eth0", &params).unwrap();

        let via_reset = SimulatedShaper::new();
        via_reset.apply("eth0", &ShapingParams::with_delay(500.0)).unwrap();
        via_reset.reset("eth0").unwrap();
        via_reset.apply("eth0", &params).unwrap();

        assert_eq!(direct.current("eth0"), via_reset.current("eth0"));
    }

    #[test]
    fn test_reset_installs_passthrough() {
        let shaper = SimulatedShaper::new();
        shaper.apply("eth0", &ShapingParams::with_delay(80.0)).unwrap();
        shaper.reset("eth0").unwrap();
        assert_eq!(shaper.current("eth0"), Some(ShapingParams::PASSTHROUGH));
    }

    #[test]
    fn test_interfaces_are_independent() {
        let shaper = SimulatedShaper::new();
        shaper.apply("eth0", &ShapingParams::with_delay(10.0)).unwrap();
        shaper.apply("eth1", &ShapingParams::with_delay(20.0)).unwrap();

        assert_eq!(shaper.current("eth0").unwrap().delay_ms, 10.0);
        assert_eq!(shaper.current("eth1").unwrap().delay_ms, 20.0);
        assert_eq!(shaper.current("eth2"), None);
    }

    #[test]
    fn test_failing_leaves_state_untouched() {
        let shaper = SimulatedShaper::new();
        shaper.apply("eth0", &ShapingParams::with_delay(10.0)).unwrap();
        shaper.set_failing(true);

        assert!(matches!(
            shaper.reset("eth0"),
            Err(ShapingError::Unavailable { .. })
        ));
        assert_eq!(shaper.apply_count(), 1);
    }
}
