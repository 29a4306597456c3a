//! SQLite metrics store
//!
//! One append-only `metric_events` table, partitioned by `experiment_id`.
//! Records are never updated or deleted; duplicates are kept as submitted.

use chrono::{DateTime, Utc};
use model::{IngestError, MetricEvent, MetricSubmission};
use rusqlite::{Connection, params};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

/// Optional query filters; `None` leaves that side open
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    /// Inclusive lower bound on event time (Unix seconds)
    pub start_time: Option<f64>,
    /// Inclusive upper bound on event time (Unix seconds)
    pub end_time: Option<f64>,
}

/// Outcome of feeding a batch of raw records through ingestion
#[derive(Debug, Default)]
pub struct ImportReport {
    pub stored: usize,
    /// 1-based record number and the reason it was rejected
    pub rejected: Vec<(usize, IngestError)>,
}

struct Inner {
    conn: Connection,
    last_stored_us: i64,
}

pub struct MetricsStore {
    inner: Mutex<Inner>,
}

impl MetricsStore {
    /// Open (or create) the store at `path` and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        // WAL lets an export read while a client keeps submitting
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        debug!("Initializing metrics schema");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metric_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                event_time REAL NOT NULL,
                event_type TEXT NOT NULL,
                protocol TEXT NOT NULL,
                video_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                stored_at_us INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_metric_events_experiment
                ON metric_events(experiment_id, event_time)",
            [],
        )?;

        let last_stored_us: i64 = conn.query_row(
            "SELECT COALESCE(MAX(stored_at_us), 0) FROM metric_events",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                last_stored_us,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one event to its experiment's partition
    pub fn store(&self, submission: MetricSubmission) -> Result<MetricEvent, StorageError> {
        let payload = serde_json::to_string(&submission.payload)?;
        let mut inner = self.lock();

        // stored_at never goes backwards, even if the wall clock does
        let stored_us = Utc::now().timestamp_micros().max(inner.last_stored_us);

        inner.conn.execute(
            "INSERT INTO metric_events (
                experiment_id, event_time, event_type, protocol, video_id, payload, stored_at_us
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &submission.experiment_id,
                submission.event_time,
                &submission.event_type,
                &submission.protocol,
                &submission.video_id,
                payload,
                stored_us,
            ],
        )?;
        inner.last_stored_us = stored_us;

        debug!(
            "Stored {} event for {}",
            submission.event_type, submission.experiment_id
        );

        Ok(MetricEvent::from_submission(submission, to_datetime(stored_us)?))
    }

    /// Events of one experiment, ascending by event time.
    ///
    /// An unknown experiment yields an empty list.
    pub fn query(&self, experiment_id: &str, filter: &EventFilter) -> Result<Vec<MetricEvent>, StorageError> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT experiment_id, event_time, event_type, protocol, video_id, payload, stored_at_us
            FROM metric_events
            WHERE experiment_id = ?1
              AND (?2 IS NULL OR event_type = ?2)
              AND (?3 IS NULL OR event_time >= ?3)
              AND (?4 IS NULL OR event_time <= ?4)
            ORDER BY event_time ASC, id ASC",
        )?;

        let rows = stmt
            .query_map(
                params![
                    experiment_id,
                    filter.event_type,
                    filter.start_time,
                    filter.end_time
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(experiment_id, event_time, event_type, protocol, video_id, payload, stored_us)|
                 -> Result<MetricEvent, StorageError> {
                    Ok(MetricEvent {
                        experiment_id,
                        event_time,
                        event_type,
                        protocol,
                        video_id,
                        payload: serde_json::from_str(&payload)?,
                        stored_at: to_datetime(stored_us)?,
                    })
                },
            )
            .collect()
    }

    /// Write every event of `experiment_id` as a JSON array; returns the count
    pub fn export<W: Write>(&self, experiment_id: &str, mut writer: W) -> Result<usize, StorageError> {
        let events = self.query(experiment_id, &EventFilter::default())?;

        serde_json::to_writer_pretty(&mut writer, &events)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(events.len())
    }

    pub fn export_to_path<P: AsRef<Path>>(&self, experiment_id: &str, path: P) -> Result<usize, StorageError> {
        let file = std::fs::File::create(path.as_ref())?;
        let count = self.export(experiment_id, std::io::BufWriter::new(file))?;

        info!(
            "Exported {} events for {} to {:?}",
            count,
            experiment_id,
            path.as_ref()
        );
        Ok(count)
    }

    /// Validate and store one raw record from the ingestion boundary.
    ///
    /// The outer error is a storage failure; the inner one a rejected record.
    pub fn ingest_value(&self, value: &Value) -> Result<Result<MetricEvent, IngestError>, StorageError> {
        match MetricSubmission::from_json(value) {
            Ok(submission) => self.store(submission).map(Ok),
            Err(e) => Ok(Err(e)),
        }
    }

    /// Feed a JSON array or JSON-lines document through ingestion.
    ///
    /// Rejected records are reported and skipped; storage failures abort.
    pub fn import<R: Read>(&self, mut reader: R) -> Result<ImportReport, StorageError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;

        let values: Vec<Value> = if contents.trim_start().starts_with('[') {
            serde_json::from_str(&contents)?
        } else {
            contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str)
                .collect::<Result<_, _>>()?
        };

        let mut report = ImportReport::default();
        for (index, value) in values.iter().enumerate() {
            match self.ingest_value(value)? {
                Ok(_) => report.stored += 1,
                Err(e) => {
                    warn!("Rejected record {}: {}", index + 1, e);
                    report.rejected.push((index + 1, e));
                }
            }
        }

        Ok(report)
    }
}

fn to_datetime(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(micros).ok_or(StorageError::InvalidTimestamp(micros))
}
