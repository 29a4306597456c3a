//! Testbed constants and well-known names

/// Token in a scenario's media URL that is replaced by the server address
pub const SERVER_ADDRESS_PLACEHOLDER: &str = "SERVER_PUBLIC_IP";

/// `video_id` assigned to submissions that do not carry one
pub const UNKNOWN_VIDEO_ID: &str = "unknown";

/// Trace columns that must be present in the header row
pub const TRACE_REQUIRED_COLUMNS: [&str; 3] = ["time_ms", "delay_ms", "loss_pct"];

/// Traces shorter than this load fine but are reported as suspicious
pub const TRACE_MIN_RECOMMENDED_ROWS: usize = 2;

/// Fields every metric submission must carry
pub const SUBMISSION_REQUIRED_FIELDS: [&str; 5] =
    ["experiment_id", "timestamp", "event_type", "protocol", "payload"];

/// Result directory layout
pub const SCENARIO_SNAPSHOT_FILE: &str = "scenario.yaml";
pub const STATIC_PROFILE_SNAPSHOT_FILE: &str = "profile.yaml";
pub const TRACE_SNAPSHOT_FILE: &str = "trace.csv";
pub const RUN_RECORD_FILE: &str = "run.json";
pub const STATS_DIR: &str = "stats";
pub const LOGS_DIR: &str = "logs";
pub const METRICS_EXPORT_FILE: &str = "metrics.json";
pub const ORCHESTRATOR_LOG_FILE: &str = "orchestrator.log";

/// Format of the timestamp suffix in run ids (e.g. `exp_001_20240101_120000`)
pub const RUN_ID_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
