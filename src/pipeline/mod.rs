use log::{info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunker::{StreamChunker, VideoChunk};
use crate::config::{self, EventDefinition, PipelineConfig, StreamConfig};
use crate::db::EventStore;
use crate::detector::{EventDetector, HttpInferenceClient, InferenceClient};
use crate::error::Error;
use crate::extractor::{FfmpegFrameSampler, FrameSampler};
use crate::recorder::EventRecorder;
use crate::retention::RetentionSweeper;

/// Lifecycle of the detection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    /// Running, but the source has been unreachable past the retry budget.
    Degraded,
    Stopping,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Degraded => "degraded",
            PipelineState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Current state, readable without touching the run lock.
pub struct StateCell {
    inner: std::sync::Mutex<PipelineState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(PipelineState::Idle),
        }
    }

    pub fn get(&self) -> PipelineState {
        *self.inner.lock().unwrap()
    }

    pub fn set(&self, state: PipelineState) {
        *self.inner.lock().unwrap() = state;
    }

    /// Degraded is only entered from Running, so a stop in progress is
    /// never overwritten by a late source failure.
    pub fn mark_degraded(&self) {
        let mut state = self.inner.lock().unwrap();
        if *state == PipelineState::Running {
            *state = PipelineState::Degraded;
        }
    }

    pub fn mark_recovered(&self) {
        let mut state = self.inner.lock().unwrap();
        if *state == PipelineState::Degraded {
            *state = PipelineState::Running;
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Run counters, shared across workers.
#[derive(Default)]
pub struct PipelineMetrics {
    chunks_processed: AtomicU64,
    chunks_dropped: AtomicU64,
    events_detected: AtomicU64,
    events_dropped: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
}

impl PipelineMetrics {
    pub fn inc_chunks_processed(&self) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chunks_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_detected(&self) {
        self.events_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_events_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, message: &str) {
        *self.last_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn chunks_processed(&self) -> u64 {
        self.chunks_processed.load(Ordering::Relaxed)
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }

    pub fn events_detected(&self) -> u64 {
        self.events_detected.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.chunks_processed.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.events_detected.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = None;
    }
}

/// Snapshot returned by the status operation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub run_id: Option<Uuid>,
    pub chunks_processed: u64,
    pub chunks_dropped: u64,
    pub events_detected: u64,
    pub events_dropped: u64,
    pub last_error: Option<String>,
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the lifecycle of a detection run: start validates and spawns the
/// chunker, detection workers, recorder and retention sweeper; stop drains
/// them within a grace period; status is a non-blocking snapshot.
pub struct PipelineController {
    active: AsyncMutex<Option<ActiveRun>>,
    state: Arc<StateCell>,
    metrics: Arc<PipelineMetrics>,
    store: Arc<dyn EventStore>,
    settings: PipelineConfig,
    sampler: Arc<dyn FrameSampler>,
    client_override: Option<Arc<dyn InferenceClient>>,
    run_id: std::sync::Mutex<Option<Uuid>>,
}

impl PipelineController {
    pub fn new(store: Arc<dyn EventStore>, settings: PipelineConfig) -> Self {
        Self {
            active: AsyncMutex::new(None),
            state: Arc::new(StateCell::new()),
            metrics: Arc::new(PipelineMetrics::default()),
            store,
            settings,
            sampler: Arc::new(FfmpegFrameSampler::new()),
            client_override: None,
            run_id: std::sync::Mutex::new(None),
        }
    }

    /// Replace the frame sampler (tests).
    pub fn with_sampler(mut self, sampler: Arc<dyn FrameSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Replace the inference client (tests).
    pub fn with_inference_client(mut self, client: Arc<dyn InferenceClient>) -> Self {
        self.client_override = Some(client);
        self
    }

    /// Start a run. Rejects with `AlreadyRunning` while a run exists in any
    /// non-idle state, and with `Config` when validation fails; a rejected
    /// start leaves an active run untouched.
    pub async fn start(
        &self,
        config: StreamConfig,
        definitions: Vec<EventDefinition>,
    ) -> Result<Uuid, Error> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::AlreadyRunning);
        }

        config::validate(&config, &definitions)?;

        let client: Arc<dyn InferenceClient> = match &self.client_override {
            Some(client) => client.clone(),
            None => {
                let api_key = config
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("VIGIL_API_KEY").ok());
                Arc::new(HttpInferenceClient::new(
                    &config.base_url,
                    api_key,
                    self.settings.inference_timeout_secs,
                )?)
            }
        };

        self.state.set(PipelineState::Starting);
        self.metrics.reset();

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        // mpsc::channel panics on a zero capacity, which is reachable from
        // an operator-supplied config file
        let capacity = self.settings.queue_capacity.max(1);
        let (chunk_tx, chunk_rx) = mpsc::channel::<VideoChunk>(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let mut tasks = Vec::new();

        let chunker = StreamChunker::new(
            config.clone(),
            chunk_tx,
            self.metrics.clone(),
            self.state.clone(),
            self.settings.max_source_retries,
        );
        tasks.push(tokio::spawn(chunker.run(cancel.clone())));

        let chunk_rx = Arc::new(AsyncMutex::new(chunk_rx));
        for _ in 0..self.settings.detector_workers.max(1) {
            let detector = Arc::new(EventDetector::new(
                config.clone(),
                definitions.clone(),
                self.sampler.clone(),
                client.clone(),
                event_tx.clone(),
                self.metrics.clone(),
                self.settings.max_inference_attempts,
            ));
            tasks.push(tokio::spawn(
                detector.run(chunk_rx.clone(), cancel.clone()),
            ));
        }
        drop(event_tx);

        let recorder = EventRecorder::new(
            self.store.clone(),
            self.metrics.clone(),
            self.settings.max_pending_events,
        );
        tasks.push(tokio::spawn(recorder.run(event_rx, cancel.clone())));

        let sweeper = RetentionSweeper::new(
            config.output_dir.clone(),
            self.settings.retention.clone(),
        );
        tasks.push(tokio::spawn(sweeper.run(cancel.clone())));

        *active = Some(ActiveRun {
            run_id,
            cancel,
            tasks,
        });
        *self.run_id.lock().unwrap() = Some(run_id);
        self.state.set(PipelineState::Running);
        info!("Pipeline run {} started on {}", run_id, config.source_url);
        Ok(run_id)
    }

    /// Stop the active run. Idempotent: stopping an idle pipeline is a
    /// successful no-op. Workers get `stop_grace_secs` to drain before they
    /// are aborted.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut active = self.active.lock().await;
        let run = match active.take() {
            Some(run) => run,
            None => return Ok(()),
        };

        self.state.set(PipelineState::Stopping);
        info!("Stopping pipeline run {}", run.run_id);
        run.cancel.cancel();

        let grace = Duration::from_secs(self.settings.stop_grace_secs);
        for mut task in run.tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("Worker did not stop within {:?}, aborting", grace);
                task.abort();
            }
        }

        *self.run_id.lock().unwrap() = None;
        self.state.set(PipelineState::Idle);
        info!("Pipeline run {} stopped", run.run_id);
        Ok(())
    }

    /// Non-blocking snapshot of state and counters. Never waits on the run
    /// lock, so it answers even while a start or stop is in flight.
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state.get(),
            run_id: *self.run_id.lock().unwrap(),
            chunks_processed: self.metrics.chunks_processed(),
            chunks_dropped: self.metrics.chunks_dropped(),
            events_detected: self.metrics.events_detected(),
            events_dropped: self.metrics.events_dropped(),
            last_error: self.metrics.last_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_only_from_running() {
        let cell = StateCell::new();
        cell.mark_degraded();
        assert_eq!(cell.get(), PipelineState::Idle);

        cell.set(PipelineState::Running);
        cell.mark_degraded();
        assert_eq!(cell.get(), PipelineState::Degraded);

        cell.mark_recovered();
        assert_eq!(cell.get(), PipelineState::Running);
    }

    #[test]
    fn test_recovered_only_from_degraded() {
        let cell = StateCell::new();
        cell.set(PipelineState::Stopping);
        cell.mark_recovered();
        assert_eq!(cell.get(), PipelineState::Stopping);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = PipelineMetrics::default();
        metrics.inc_chunks_processed();
        metrics.inc_events_detected();
        metrics.set_last_error("boom");
        metrics.reset();
        assert_eq!(metrics.chunks_processed.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.events_detected.load(Ordering::Relaxed), 0);
        assert!(metrics.last_error.lock().unwrap().is_none());
    }
}
