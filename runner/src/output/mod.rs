//! Output and display helpers

use crate::batch::BatchSummary;
use crate::orchestrator::ExperimentRun;
use anyhow::Result;
use model::MetricEvent;
use std::path::Path;

const RULE: &str = "============================================================";

/// Export metric events as CSV. The payload column holds compact JSON.
pub fn export_csv(events: &[MetricEvent], output_path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_path)?;

    writer.write_record([
        "experiment_id",
        "timestamp",
        "event_type",
        "protocol",
        "video_id",
        "payload",
        "stored_at",
    ])?;

    for e in events {
        writer.write_record(&[
            e.experiment_id.clone(),
            e.event_time.to_string(),
            e.event_type.clone(),
            e.protocol.clone(),
            e.video_id.clone(),
            serde_json::to_string(&e.payload)?,
            e.stored_at.to_rfc3339(),
        ])?;
    }

    writer.flush()?;

    Ok(())
}

pub fn print_run(run: &ExperimentRun) {
    println!("{}", RULE);
    println!("Experiment {}: {}", run.scenario_id, run.status);
    if let Some(dir) = &run.result_dir {
        println!("Results: {}", dir.display());
    }
    if let Some(count) = run.exported_events {
        println!("Exported events: {}", count);
    }
    if let Some(error) = &run.error {
        println!("Error: {}", error);
    }
    for warning in &run.warnings {
        println!("Warning: {}", warning);
    }
    println!("{}", RULE);
}

pub fn print_batch_summary(summary: &BatchSummary) {
    println!();
    println!("{}", RULE);
    println!("BATCH SUMMARY");
    println!("{}", RULE);
    println!("Total: {}", summary.total());
    println!("Successful: {}", summary.succeeded());
    println!("Failed: {}", summary.failed());
    if summary.skipped > 0 {
        println!("Not started: {}", summary.skipped);
    }
    println!();

    for outcome in &summary.outcomes {
        let mark = if outcome.succeeded() { "✓" } else { "✗" };
        match &outcome.error {
            Some(error) => println!("{} {}: {} ({})", mark, outcome.scenario_id, outcome.status, error),
            None => println!("{} {}: {}", mark, outcome.scenario_id, outcome.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_export_csv_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");

        let event = MetricEvent {
            experiment_id: "exp_a".to_string(),
            event_time: 12.5,
            event_type: "playback_stalled".to_string(),
            protocol: "dash".to_string(),
            video_id: "unknown".to_string(),
            payload: json!({"duration_ms": 800}),
            stored_at: Utc::now(),
        };
        export_csv(&[event], &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap().get(5), Some("payload"));

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "12.5");
        assert_eq!(&rows[0][5], r#"{"duration_ms":800}"#);
    }
}
