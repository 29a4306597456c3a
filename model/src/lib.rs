//! Testbed Model Library
//!
//! Shared definitions for the streaming testbed: shaping parameters,
//! network profiles (static and trace), scenarios and metric events.
//! Everything in here is pure parsing and validation; nothing touches the
//! network or the metrics database.

pub mod constants;
pub mod error;
pub mod event;
pub mod params;
pub mod profile;
pub mod scenario;

pub use constants::*;
pub use error::{IngestError, ValidationError};
pub use event::{MetricEvent, MetricSubmission};
pub use params::ShapingParams;
pub use profile::{NetworkProfile, ProfileKind, Trace, TraceSegment};
pub use scenario::{Protocol, Scenario};
