use async_trait::async_trait;
use log::info;
use sqlx::PgPool;
use std::sync::Arc;

use super::models::{DetectedEvent, EventRow};
use super::EventStore;
use crate::error::Error;

/// Postgres-backed event log.
pub struct PgEventStore {
    pool: Arc<PgPool>,
}

impl PgEventStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the event log table and the idempotency index if they do not
    /// exist yet.
    pub async fn setup(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_logs (
                event_id BIGSERIAL PRIMARY KEY,
                event_timestamp TIMESTAMPTZ NOT NULL,
                event_code TEXT NOT NULL,
                event_description TEXT NOT NULL,
                detection_guidelines TEXT NOT NULL,
                event_video_url TEXT NOT NULL,
                event_detection_explanation_by_ai TEXT NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create event_logs table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS event_logs_code_video_idx
            ON event_logs (event_code, event_video_url)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create idempotency index: {}", e)))?;

        info!("Event log schema ready");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: &DetectedEvent) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO event_logs (
                event_timestamp, event_code, event_description,
                detection_guidelines, event_video_url,
                event_detection_explanation_by_ai
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_code, event_video_url) DO NOTHING
            "#,
        )
        .bind(event.event_timestamp)
        .bind(&event.event_code)
        .bind(&event.event_description)
        .bind(&event.detection_guidelines)
        .bind(&event.event_video_url)
        .bind(&event.event_detection_explanation_by_ai)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to insert event: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<EventRow>, Error> {
        sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, event_timestamp, event_code, event_description,
                   detection_guidelines, event_video_url,
                   event_detection_explanation_by_ai
            FROM event_logs
            ORDER BY event_timestamp DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch events: {}", e)))
    }
}
