pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Error;
use models::{DetectedEvent, EventRow};

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// Durable sink for confirmed detections.
///
/// `insert` is idempotent on `(event_code, event_video_url)`: writing the
/// same detection twice is a no-op and reports `Ok(false)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert an event. Returns true if a new row was written, false if an
    /// identical detection was already recorded.
    async fn insert(&self, event: &DetectedEvent) -> Result<bool, Error>;

    /// Most recent events, newest first.
    async fn recent(&self, limit: i64) -> Result<Vec<EventRow>, Error>;
}
