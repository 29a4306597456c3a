//! Kernel shaping through `tc`
//!
//! Topology installed on every apply:
//!
//! ```text
//! root 1: prio
//!   └─ parent 1:1 handle 2: netem <delay/jitter/loss/rate>
//! filter u32 match ip dst 0.0.0.0/0 -> flowid 1:1
//! ```
//!
//! Passthrough keeps the same topology with `netem delay 0ms`, so switching
//! between parameter sets never has to rebuild the filter chain.

use super::{Shaper, ShapingError};
use model::ShapingParams;
use std::process::Command;
use tracing::debug;

pub struct TcShaper {
    tc_path: String,
    use_sudo: bool,
}

impl TcShaper {
    pub fn new(tc_path: String, use_sudo: bool) -> Self {
        Self { tc_path, use_sudo }
    }

    fn command(&self, args: &[String]) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.tc_path).args(args);
            cmd
        } else {
            let mut cmd = Command::new(&self.tc_path);
            cmd.args(args);
            cmd
        }
    }

    fn run(&self, args: &[String]) -> Result<(), ShapingError> {
        let rendered = format!("{} {}", self.tc_path, args.join(" "));
        debug!("Running: {}", rendered);

        let output = self
            .command(args)
            .output()
            .map_err(|source| ShapingError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ShapingError::CommandFailed {
                command: rendered,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

impl Shaper for TcShaper {
    fn apply(&self, interface: &str, params: &ShapingParams) -> Result<(), ShapingError> {
        // Fails when no root qdisc is installed yet, which is fine
        if let Err(e) = self.run(&clear_args(interface)) {
            debug!("Clearing root qdisc on {}: {}", interface, e);
        }

        for args in install_args(interface, params) {
            self.run(&args)?;
        }

        debug!("Applied {} to {}", params, interface);
        Ok(())
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn clear_args(interface: &str) -> Vec<String> {
    owned(&["qdisc", "del", "dev", interface, "root"])
}

/// netem parameter list for `params`; `delay 0ms` for passthrough
fn netem_args(params: &ShapingParams) -> Vec<String> {
    let mut args = Vec::new();

    if params.delay_ms > 0.0 || params.jitter_ms > 0.0 {
        args.push("delay".to_string());
        args.push(format!("{}ms", params.delay_ms));
        if params.jitter_ms > 0.0 {
            args.push(format!("{}ms", params.jitter_ms));
        }
    }

    if params.loss_pct > 0.0 {
        args.push("loss".to_string());
        args.push(format!("{}%", params.loss_pct));
    }

    if let Some(rate) = params.rate_mbps {
        args.push("rate".to_string());
        args.push(format!("{}mbit", rate));
    }

    if args.is_empty() {
        args = owned(&["delay", "0ms"]);
    }

    args
}

/// Commands run after clearing the root qdisc
fn install_args(interface: &str, params: &ShapingParams) -> Vec<Vec<String>> {
    let root = owned(&["qdisc", "add", "dev", interface, "root", "handle", "1:", "prio"]);

    let mut leaf = owned(&[
        "qdisc", "add", "dev", interface, "parent", "1:1", "handle", "2:", "netem",
    ]);
    leaf.extend(netem_args(params));

    let filter = owned(&[
        "filter", "add", "dev", interface, "protocol", "ip", "parent", "1:0", "prio", "1", "u32",
        "match", "ip", "dst", "0.0.0.0/0", "flowid", "1:1",
    ]);

    vec![root, leaf, filter]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netem_args_full() {
        let params = ShapingParams::new(50.0, 10.0, 1.5, Some(5.0));
        assert_eq!(
            netem_args(&params),
            vec!["delay", "50ms", "10ms", "loss", "1.5%", "rate", "5mbit"]
        );
    }

    #[test]
    fn test_netem_args_jitter_only() {
        let params = ShapingParams::new(0.0, 7.0, 0.0, None);
        assert_eq!(netem_args(&params), vec!["delay", "0ms", "7ms"]);
    }

    #[test]
    fn test_passthrough_keeps_topology() {
        let commands = install_args("eth0", &ShapingParams::PASSTHROUGH);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].join(" "), "qdisc add dev eth0 root handle 1: prio");
        assert_eq!(
            commands[1].join(" "),
            "qdisc add dev eth0 parent 1:1 handle 2: netem delay 0ms"
        );
        assert!(commands[2].join(" ").ends_with("flowid 1:1"));
    }

    #[test]
    fn test_install_args_identical_for_identical_params() {
        let params = ShapingParams::new(20.0, 0.0, 0.0, Some(3.0));
        assert_eq!(install_args("eth0", &params), install_args("eth0", &params));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let shaper = TcShaper::new("/nonexistent/tc-binary".to_string(), false);
        let err = shaper.apply("eth0", &ShapingParams::PASSTHROUGH).unwrap_err();
        assert!(matches!(err, ShapingError::Spawn { .. }));
    }

    #[test]
    fn test_failing_command_is_reported() {
        // `false` exits non-zero for any arguments
        let shaper = TcShaper::new("false".to_string(), false);
        let err = shaper.reset("eth0").unwrap_err();
        assert!(matches!(err, ShapingError::CommandFailed { .. }));
    }
}
