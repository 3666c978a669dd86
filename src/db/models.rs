use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A confirmed detection, ready to be written to the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedEvent {
    pub event_timestamp: DateTime<Utc>,
    pub event_code: String,
    pub event_description: String,
    pub detection_guidelines: String,
    /// Path of the chunk file the detection came from. Together with the
    /// event code this forms the idempotency key.
    pub event_video_url: String,
    pub event_detection_explanation_by_ai: String,
}

/// A stored event log row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRow {
    pub event_id: i64,
    pub event_timestamp: DateTime<Utc>,
    pub event_code: String,
    pub event_description: String,
    pub detection_guidelines: String,
    pub event_video_url: String,
    pub event_detection_explanation_by_ai: String,
}
