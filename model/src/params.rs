//! Shaping parameter sets

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One set of link conditions enforced on an interface.
///
/// `rate_mbps` is an explicit option: `None` means no rate limit. A present
/// value must be strictly positive, so there is no ambiguity between
/// "unlimited" and "zero".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapingParams {
    /// Base one-way delay in milliseconds
    pub delay_ms: f64,

    /// Delay variation in milliseconds
    pub jitter_ms: f64,

    /// Random packet loss percentage (0-100)
    pub loss_pct: f64,

    /// Rate limit in Mbit/s (None = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_mbps: Option<f64>,
}

impl ShapingParams {
    /// Zero delay, zero loss, no rate limit
    pub const PASSTHROUGH: ShapingParams = ShapingParams {
        delay_ms: 0.0,
        jitter_ms: 0.0,
        loss_pct: 0.0,
        rate_mbps: None,
    };

    pub fn new(delay_ms: f64, jitter_ms: f64, loss_pct: f64, rate_mbps: Option<f64>) -> Self {
        Self {
            delay_ms,
            jitter_ms,
            loss_pct,
            rate_mbps,
        }
    }

    /// Convenience constructor for delay-only conditions
    pub fn with_delay(delay_ms: f64) -> Self {
        Self {
            delay_ms,
            ..Self::PASSTHROUGH
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.delay_ms == 0.0 && self.jitter_ms == 0.0 && self.loss_pct == 0.0 && self.rate_mbps.is_none()
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_non_negative("delay_ms", self.delay_ms)?;
        check_non_negative("jitter_ms", self.jitter_ms)?;

        if !self.loss_pct.is_finite() || !(0.0..=100.0).contains(&self.loss_pct) {
            return Err(ValidationError::OutOfRange {
                field: "loss_pct",
                expected: "between 0 and 100",
                value: self.loss_pct,
            });
        }

        if let Some(rate) = self.rate_mbps {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ValidationError::OutOfRange {
                    field: "rate_mbps",
                    expected: "> 0 when present",
                    value: rate,
                });
            }
        }

        Ok(())
    }
}

impl Default for ShapingParams {
    fn default() -> Self {
        Self::PASSTHROUGH
    }
}

impl fmt::Display for ShapingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delay={}ms jitter={}ms loss={}%",
            self.delay_ms, self.jitter_ms, self.loss_pct
        )?;
        match self.rate_mbps {
            Some(rate) => write!(f, " rate={}Mbps", rate),
            None => write!(f, " rate=unlimited"),
        }
    }
}

fn check_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::OutOfRange {
            field,
            expected: ">= 0",
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_is_default() {
        assert_eq!(ShapingParams::default(), ShapingParams::PASSTHROUGH);
        assert!(ShapingParams::PASSTHROUGH.is_passthrough());
        assert!(!ShapingParams::with_delay(10.0).is_passthrough());
    }

    #[test]
    fn test_validate_ranges() {
        assert!(ShapingParams::new(50.0, 5.0, 1.0, Some(10.0)).validate().is_ok());
        assert!(ShapingParams::new(0.0, 0.0, 100.0, None).validate().is_ok());

        assert!(ShapingParams::new(-1.0, 0.0, 0.0, None).validate().is_err());
        assert!(ShapingParams::new(0.0, -0.5, 0.0, None).validate().is_err());
        assert!(ShapingParams::new(0.0, 0.0, 100.5, None).validate().is_err());
        assert!(ShapingParams::new(0.0, 0.0, -1.0, None).validate().is_err());
        assert!(ShapingParams::new(f64::NAN, 0.0, 0.0, None).validate().is_err());
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        let err = ShapingParams::new(0.0, 0.0, 0.0, Some(0.0)).validate().unwrap_err();
        assert!(err.to_string().contains("rate_mbps"));
        assert!(ShapingParams::new(0.0, 0.0, 0.0, Some(-2.0)).validate().is_err());
    }
}
