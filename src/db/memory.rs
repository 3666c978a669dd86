use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::{DetectedEvent, EventRow};
use super::EventStore;
use crate::error::Error;

/// In-memory event log used when no database is configured, and in tests.
/// Same idempotency contract as the Postgres store.
#[derive(Default)]
pub struct MemoryEventStore {
    rows: RwLock<Vec<EventRow>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: &DetectedEvent) -> Result<bool, Error> {
        let mut rows = self.rows.write().await;
        let duplicate = rows.iter().any(|r| {
            r.event_code == event.event_code && r.event_video_url == event.event_video_url
        });
        if duplicate {
            return Ok(false);
        }
        let event_id = rows.len() as i64 + 1;
        rows.push(EventRow {
            event_id,
            event_timestamp: event.event_timestamp,
            event_code: event.event_code.clone(),
            event_description: event.event_description.clone(),
            detection_guidelines: event.detection_guidelines.clone(),
            event_video_url: event.event_video_url.clone(),
            event_detection_explanation_by_ai: event.event_detection_explanation_by_ai.clone(),
        });
        Ok(true)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<EventRow>, Error> {
        let rows = self.rows.read().await;
        let mut out: Vec<EventRow> = rows.clone();
        out.sort_by(|a, b| b.event_timestamp.cmp(&a.event_timestamp));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}
