//! Metric events reported by session clients

use crate::constants::UNKNOWN_VIDEO_ID;
use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A validated submission, before the store assigns `stored_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSubmission {
    pub experiment_id: String,

    /// Client-supplied event time (Unix seconds)
    #[serde(rename = "timestamp")]
    pub event_time: f64,

    /// e.g. "fragment_loading_completed", "playback_stalled"
    pub event_type: String,

    pub protocol: String,
    pub video_id: String,

    /// Opaque event-specific data
    pub payload: Value,
}

impl MetricSubmission {
    /// Validate a raw record received at the ingestion boundary.
    ///
    /// `experiment_id`, `timestamp`, `event_type`, `protocol` and `payload`
    /// are required; `video_id` defaults to "unknown".
    pub fn from_json(value: &Value) -> Result<Self, IngestError> {
        let object = value.as_object().ok_or(IngestError::NotAnObject)?;

        let experiment_id = required_str(object, "experiment_id")?;
        let event_time = required(object, "timestamp")?
            .as_f64()
            .ok_or(IngestError::InvalidField {
                field: "timestamp",
                expected: "a number",
            })?;
        let event_type = required_str(object, "event_type")?;
        let protocol = required_str(object, "protocol")?;
        let payload = required(object, "payload")?.clone();

        let video_id = match object.get("video_id") {
            None | Some(Value::Null) => UNKNOWN_VIDEO_ID.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(IngestError::InvalidField {
                    field: "video_id",
                    expected: "a string",
                });
            }
        };

        Ok(Self {
            experiment_id,
            event_time,
            event_type,
            protocol,
            video_id,
            payload,
        })
    }
}

fn required<'a>(object: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, IngestError> {
    object.get(field).ok_or(IngestError::MissingField(field))
}

fn required_str(object: &Map<String, Value>, field: &'static str) -> Result<String, IngestError> {
    required(object, field)?
        .as_str()
        .map(str::to_string)
        .ok_or(IngestError::InvalidField {
            field,
            expected: "a string",
        })
}

/// A stored metric record. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub experiment_id: String,

    #[serde(rename = "timestamp")]
    pub event_time: f64,

    pub event_type: String,
    pub protocol: String,
    pub video_id: String,
    pub payload: Value,

    /// Assigned by the store at ingestion
    pub stored_at: DateTime<Utc>,
}

impl MetricEvent {
    pub fn from_submission(submission: MetricSubmission, stored_at: DateTime<Utc>) -> Self {
        Self {
            experiment_id: submission.experiment_id,
            event_time: submission.event_time,
            event_type: submission.event_type,
            protocol: submission.protocol,
            video_id: submission.video_id,
            payload: submission.payload,
            stored_at,
        }
    }

    /// Client-supplied part of the record
    pub fn to_submission(&self) -> MetricSubmission {
        MetricSubmission {
            experiment_id: self.experiment_id.clone(),
            event_time: self.event_time,
            event_type: self.event_type.clone(),
            protocol: self.protocol.clone(),
            video_id: self.video_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "experiment_id": "exp_001",
            "timestamp": 1700000000.25,
            "event_type": "fragment_loading_completed",
            "protocol": "dash",
            "video_id": "http://server/manifest.mpd",
            "payload": {"bitrate": 3000, "buffer_level": 4.2}
        })
    }

    #[test]
    fn test_valid_submission() {
        let submission = MetricSubmission::from_json(&sample()).unwrap();
        assert_eq!(submission.experiment_id, "exp_001");
        assert_eq!(submission.event_time, 1700000000.25);
        assert_eq!(submission.payload["bitrate"], 3000);
    }

    #[test]
    fn test_missing_protocol_rejected() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("protocol");
        assert_eq!(
            MetricSubmission::from_json(&value),
            Err(IngestError::MissingField("protocol"))
        );
    }

    #[test]
    fn test_every_required_field_checked() {
        for field in crate::constants::SUBMISSION_REQUIRED_FIELDS {
            let mut value = sample();
            value.as_object_mut().unwrap().remove(field);
            assert_eq!(
                MetricSubmission::from_json(&value),
                Err(IngestError::MissingField(field))
            );
        }
    }

    #[test]
    fn test_video_id_defaults_to_unknown() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("video_id");
        let submission = MetricSubmission::from_json(&value).unwrap();
        assert_eq!(submission.video_id, UNKNOWN_VIDEO_ID);
    }

    #[test]
    fn test_wrong_types_rejected() {
        let mut value = sample();
        value["timestamp"] = json!("yesterday");
        assert!(matches!(
            MetricSubmission::from_json(&value),
            Err(IngestError::InvalidField { field: "timestamp", .. })
        ));

        assert_eq!(
            MetricSubmission::from_json(&json!([1, 2, 3])),
            Err(IngestError::NotAnObject)
        );
    }

    #[test]
    fn test_integer_timestamp_accepted() {
        let mut value = sample();
        value["timestamp"] = json!(1700000000);
        let submission = MetricSubmission::from_json(&value).unwrap();
        assert_eq!(submission.event_time, 1700000000.0);
    }

    #[test]
    fn test_event_serializes_with_timestamp_key() {
        let submission = MetricSubmission::from_json(&sample()).unwrap();
        let event = MetricEvent::from_submission(submission.clone(), Utc::now());
        let value = serde_json::to_value(&event).unwrap();

        assert!(value.get("timestamp").is_some());
        assert!(value.get("stored_at").is_some());
        assert_eq!(MetricSubmission::from_json(&value).unwrap(), submission);
    }
}
