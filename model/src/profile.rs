//! Network profiles: static parameter sets and time-series traces

use crate::constants::{TRACE_MIN_RECOMMENDED_ROWS, TRACE_REQUIRED_COLUMNS};
use crate::error::ValidationError;
use crate::params::ShapingParams;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Profile flavour as named in scenario files (`network_profile.type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Static,
    Trace,
}

impl FromStr for ProfileKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "trace" => Ok(Self::Trace),
            other => Err(ValidationError::UnknownProfileType(other.to_string())),
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => f.write_str("static"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

/// Parameters that take effect `offset_ms` after replay start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceSegment {
    pub offset_ms: u64,
    pub params: ShapingParams,
}

impl TraceSegment {
    pub fn new(offset_ms: u64, params: ShapingParams) -> Self {
        Self { offset_ms, params }
    }
}

/// Non-empty sequence of segments sorted by offset (ties allowed).
///
/// Only constructible through validating constructors, so holders can rely on
/// both invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    segments: Vec<TraceSegment>,
}

impl Trace {
    pub fn new(segments: Vec<TraceSegment>) -> Result<Self, ValidationError> {
        if segments.is_empty() {
            return Err(ValidationError::EmptyTrace);
        }

        let mut previous = 0;
        for (i, segment) in segments.iter().enumerate() {
            if segment.offset_ms < previous {
                return Err(ValidationError::SegmentOutOfOrder {
                    index: i,
                    offset_ms: segment.offset_ms,
                    previous_ms: previous,
                });
            }
            segment.params.validate()?;
            previous = segment.offset_ms;
        }

        Ok(Self { segments })
    }

    /// Parse a CSV trace (`time_ms,delay_ms,jitter_ms,loss_pct,rate_mbps`).
    ///
    /// `jitter_ms` and `rate_mbps` columns are optional; an empty
    /// `rate_mbps` cell means no rate limit.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, ValidationError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| ValidationError::parse("trace header", e))?
            .clone();

        for column in TRACE_REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(ValidationError::MissingField(column.to_string()));
            }
        }

        let mut segments = Vec::new();
        let mut previous: Option<u64> = None;

        for record in rdr.records() {
            let record = record.map_err(|e| ValidationError::parse("trace row", e))?;
            let line = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(segments.len() + 2);

            let row: TraceRow = record
                .deserialize(Some(&headers))
                .map_err(|e| ValidationError::InvalidRow {
                    line,
                    message: e.to_string(),
                })?;

            if row.time_ms < 0 {
                return Err(ValidationError::InvalidRow {
                    line,
                    message: format!("time_ms must be >= 0, got {}", row.time_ms),
                });
            }
            let offset_ms = row.time_ms as u64;

            if let Some(previous_ms) = previous {
                if offset_ms < previous_ms {
                    return Err(ValidationError::DecreasingOffset {
                        line,
                        offset_ms,
                        previous_ms,
                    });
                }
            }

            let params = ShapingParams::new(
                row.delay_ms,
                row.jitter_ms.unwrap_or(0.0),
                row.loss_pct,
                row.rate_mbps,
            );
            params.validate().map_err(|e| ValidationError::InvalidRow {
                line,
                message: e.to_string(),
            })?;

            previous = Some(offset_ms);
            segments.push(TraceSegment::new(offset_ms, params));
        }

        Self::new(segments)
    }

    pub fn from_csv_str(contents: &str) -> Result<Self, ValidationError> {
        Self::from_csv_reader(contents.as_bytes())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ValidationError> {
        let file = std::fs::File::open(&path).map_err(|e| ValidationError::io(path.as_ref(), e))?;
        let trace = Self::from_csv_reader(file)?;

        for warning in trace.warnings() {
            warn!("{:?}: {}", path.as_ref(), warning);
        }

        Ok(trace)
    }

    pub fn segments(&self) -> &[TraceSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Offset of the last segment
    pub fn duration_ms(&self) -> u64 {
        self.segments.last().map(|s| s.offset_ms).unwrap_or(0)
    }

    /// Non-fatal findings about an otherwise valid trace
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.segments.len() < TRACE_MIN_RECOMMENDED_ROWS {
            warnings.push(format!(
                "Trace has fewer than {} data points",
                TRACE_MIN_RECOMMENDED_ROWS
            ));
        }
        warnings
    }
}

#[derive(Debug, Deserialize)]
struct TraceRow {
    time_ms: i64,
    delay_ms: f64,
    jitter_ms: Option<f64>,
    loss_pct: f64,
    rate_mbps: Option<f64>,
}

/// Static profile document. Missing keys default to 0 / no rate limit,
/// unrelated keys (name, description, ...) are ignored.
#[derive(Debug, Deserialize)]
struct StaticProfileDoc {
    #[serde(default)]
    delay_ms: f64,
    #[serde(default)]
    jitter_ms: f64,
    #[serde(default)]
    loss_pct: f64,
    #[serde(default)]
    rate_mbps: Option<f64>,
}

/// Network conditions for one scenario
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkProfile {
    Static(ShapingParams),
    Trace(Trace),
}

impl NetworkProfile {
    pub fn passthrough() -> Self {
        Self::Static(ShapingParams::PASSTHROUGH)
    }

    pub fn kind(&self) -> ProfileKind {
        match self {
            Self::Static(_) => ProfileKind::Static,
            Self::Trace(_) => ProfileKind::Trace,
        }
    }

    pub fn from_static_yaml(contents: &str) -> Result<Self, ValidationError> {
        let doc: StaticProfileDoc =
            serde_yaml::from_str(contents).map_err(|e| ValidationError::parse("static profile", e))?;

        let params = ShapingParams::new(doc.delay_ms, doc.jitter_ms, doc.loss_pct, doc.rate_mbps);
        params.validate()?;

        Ok(Self::Static(params))
    }

    /// Load a profile file of the given kind
    pub fn load<P: AsRef<Path>>(kind: ProfileKind, path: P) -> Result<Self, ValidationError> {
        match kind {
            ProfileKind::Static => {
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| ValidationError::io(path.as_ref(), e))?;
                Self::from_static_yaml(&contents)
            }
            ProfileKind::Trace => Ok(Self::Trace(Trace::load(path)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_profile_defaults() {
        let profile = NetworkProfile::from_static_yaml("name: lossy\nloss_pct: 2.5\n").unwrap();
        assert_eq!(
            profile,
            NetworkProfile::Static(ShapingParams::new(0.0, 0.0, 2.5, None))
        );
    }

    #[test]
    fn test_static_profile_full() {
        let yaml = "delay_ms: 40\njitter_ms: 10\nloss_pct: 0.5\nrate_mbps: 12\n";
        let profile = NetworkProfile::from_static_yaml(yaml).unwrap();
        assert_eq!(
            profile,
            NetworkProfile::Static(ShapingParams::new(40.0, 10.0, 0.5, Some(12.0)))
        );
        assert_eq!(profile.kind(), ProfileKind::Static);
    }

    #[test]
    fn test_static_profile_rejects_bad_loss() {
        assert!(NetworkProfile::from_static_yaml("loss_pct: 150\n").is_err());
        assert!(NetworkProfile::from_static_yaml("rate_mbps: 0\n").is_err());
        assert!(NetworkProfile::from_static_yaml("delay_ms: -5\n").is_err());
    }

    #[test]
    fn test_trace_parse() {
        let csv = "time_ms,delay_ms,loss_pct,rate_mbps\n0,50,0,10\n1000,100,1,\n";
        let trace = Trace::from_csv_str(csv).unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.segments()[0].params, ShapingParams::new(50.0, 0.0, 0.0, Some(10.0)));
        assert_eq!(trace.segments()[1].offset_ms, 1000);
        assert_eq!(trace.segments()[1].params.rate_mbps, None);
        assert_eq!(trace.duration_ms(), 1000);
        assert!(trace.warnings().is_empty());
    }

    #[test]
    fn test_trace_optional_jitter_column() {
        let csv = "time_ms,delay_ms,jitter_ms,loss_pct\n0,20,5,0\n";
        let trace = Trace::from_csv_str(csv).unwrap();
        assert_eq!(trace.segments()[0].params.jitter_ms, 5.0);
        assert_eq!(trace.warnings().len(), 1);
    }

    #[test]
    fn test_trace_rejects_decreasing_offsets() {
        let csv = "time_ms,delay_ms,loss_pct\n0,10,0\n1000,20,0\n500,30,0\n";
        match Trace::from_csv_str(csv) {
            Err(ValidationError::DecreasingOffset {
                line,
                offset_ms,
                previous_ms,
            }) => {
                assert_eq!(line, 4);
                assert_eq!(offset_ms, 500);
                assert_eq!(previous_ms, 1000);
            }
            other => panic!("expected DecreasingOffset, got {:?}", other),
        }
    }

    #[test]
    fn test_segments_out_of_order_report_index() {
        let segments = vec![
            TraceSegment::new(0, ShapingParams::PASSTHROUGH),
            TraceSegment::new(1000, ShapingParams::with_delay(20.0)),
            TraceSegment::new(500, ShapingParams::with_delay(30.0)),
        ];
        let err = Trace::new(segments).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::SegmentOutOfOrder {
                index: 2,
                offset_ms: 500,
                previous_ms: 1000
            }
        ));
        assert!(err.to_string().starts_with("Segment 2:"));
    }

    #[test]
    fn test_trace_accepts_ties() {
        let csv = "time_ms,delay_ms,loss_pct\n0,10,0\n0,20,0\n1000,30,0\n";
        let trace = Trace::from_csv_str(csv).unwrap();
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn test_trace_missing_column() {
        let err = Trace::from_csv_str("time_ms,delay_ms\n0,10\n").unwrap_err();
        assert!(matches!(err, ValidationError::MissingField(ref c) if c == "loss_pct"));
    }

    #[test]
    fn test_trace_empty() {
        let err = Trace::from_csv_str("time_ms,delay_ms,loss_pct\n").unwrap_err();
        assert!(matches!(err, ValidationError::EmptyTrace));
    }

    #[test]
    fn test_trace_row_errors() {
        assert!(Trace::from_csv_str("time_ms,delay_ms,loss_pct\n0,abc,0\n").is_err());
        assert!(Trace::from_csv_str("time_ms,delay_ms,loss_pct\n-10,5,0\n").is_err());
        assert!(Trace::from_csv_str("time_ms,delay_ms,loss_pct\n0,5,101\n").is_err());
        assert!(Trace::from_csv_str("time_ms,delay_ms,loss_pct,rate_mbps\n0,5,1,0\n").is_err());
    }

    #[test]
    fn test_trace_new_checks_order() {
        let segments = vec![
            TraceSegment::new(100, ShapingParams::PASSTHROUGH),
            TraceSegment::new(50, ShapingParams::PASSTHROUGH),
        ];
        assert!(Trace::new(segments).is_err());
        assert!(Trace::new(Vec::new()).is_err());
    }

    #[test]
    fn test_load_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        std::fs::write(&path, "time_ms,delay_ms,loss_pct\n0,10,0\n500,20,1\n").unwrap();

        let profile = NetworkProfile::load(ProfileKind::Trace, &path).unwrap();
        assert_eq!(profile.kind(), ProfileKind::Trace);

        let missing = NetworkProfile::load(ProfileKind::Static, dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ValidationError::Io { .. })));
    }

    #[test]
    fn test_profile_kind_parse() {
        assert_eq!("static".parse::<ProfileKind>().unwrap(), ProfileKind::Static);
        assert_eq!("trace".parse::<ProfileKind>().unwrap(), ProfileKind::Trace);
        assert!("dynamic".parse::<ProfileKind>().is_err());
    }
}
