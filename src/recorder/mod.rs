use log::{debug, error, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::models::DetectedEvent;
use crate::db::EventStore;
use crate::pipeline::PipelineMetrics;

const STORE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const STORE_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Drains the event queue into the store. Keeps a bounded pending buffer so
/// a slow or unavailable store never blocks detection; the oldest unwritten
/// events are dropped first when the buffer overflows.
pub struct EventRecorder {
    store: Arc<dyn EventStore>,
    metrics: Arc<PipelineMetrics>,
    max_pending: usize,
}

impl EventRecorder {
    pub fn new(
        store: Arc<dyn EventStore>,
        metrics: Arc<PipelineMetrics>,
        max_pending: usize,
    ) -> Self {
        Self {
            store,
            metrics,
            max_pending,
        }
    }

    pub async fn run(
        self,
        mut event_rx: mpsc::Receiver<DetectedEvent>,
        cancel: CancellationToken,
    ) {
        let mut pending: VecDeque<DetectedEvent> = VecDeque::new();
        let mut store_failures: u32 = 0;

        loop {
            // pull everything waiting before touching the store, so the
            // queue itself never backs up into the detector
            while let Ok(event) = event_rx.try_recv() {
                pending.push_back(event);
            }
            let dropped = trim_pending(&mut pending, self.max_pending);
            if dropped > 0 {
                warn!("Recorder buffer overflow, dropped {} oldest events", dropped);
                self.metrics.add_events_dropped(dropped as u64);
            }

            if let Some(event) = pending.front() {
                match self.store.insert(event).await {
                    Ok(true) => {
                        debug!(
                            "Recorded {} from {}",
                            event.event_code, event.event_video_url
                        );
                        pending.pop_front();
                        store_failures = 0;
                    }
                    Ok(false) => {
                        debug!(
                            "Duplicate event {} for {} skipped",
                            event.event_code, event.event_video_url
                        );
                        pending.pop_front();
                        store_failures = 0;
                    }
                    Err(e) => {
                        store_failures += 1;
                        error!("Event store write failed (attempt {}): {}", store_failures, e);
                        self.metrics.set_last_error(&e.to_string());
                        let wait = STORE_BACKOFF_BASE
                            .saturating_mul(1 << (store_failures - 1).min(16))
                            .min(STORE_BACKOFF_CAP);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_rx.recv() => {
                    match event {
                        Some(event) => pending.push_back(event),
                        None => break,
                    }
                }
            }
        }

        // one best-effort flush of whatever is still buffered
        while let Ok(event) = event_rx.try_recv() {
            pending.push_back(event);
        }
        for event in &pending {
            match self.store.insert(event).await {
                Ok(_) => {}
                Err(e) => {
                    warn!("Could not flush pending event {}: {}", event.event_code, e);
                    self.metrics.add_events_dropped(1);
                }
            }
        }
        debug!("Recorder stopped");
    }
}

/// Drop the oldest pending events beyond the cap. Returns how many were
/// dropped.
fn trim_pending(pending: &mut VecDeque<DetectedEvent>, max_pending: usize) -> usize {
    let mut dropped = 0;
    while pending.len() > max_pending {
        pending.pop_front();
        dropped += 1;
    }
    dropped
}
