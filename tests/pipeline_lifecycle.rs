use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use vigil::config::{EventDefinition, PipelineConfig, StreamConfig};
use vigil::db::MemoryEventStore;
use vigil::detector::{InferenceClient, InferenceRequest};
use vigil::extractor::{FrameSampler, SampledFrame};
use vigil::pipeline::{PipelineController, PipelineState};
use vigil::Error;

struct NoFramesSampler;

#[async_trait]
impl FrameSampler for NoFramesSampler {
    async fn sample(
        &self,
        _path: &Path,
        _frames: usize,
        _max_height: u32,
    ) -> Result<Vec<SampledFrame>, Error> {
        Ok(Vec::new())
    }
}

struct NoMatchClient;

#[async_trait]
impl InferenceClient for NoMatchClient {
    async fn complete(&self, _request: &InferenceRequest) -> Result<String, Error> {
        Ok(r#"{"events":[]}"#.to_string())
    }
}

fn controller_with(store: Arc<MemoryEventStore>, settings: PipelineConfig) -> PipelineController {
    PipelineController::new(store, settings)
        .with_sampler(Arc::new(NoFramesSampler))
        .with_inference_client(Arc::new(NoMatchClient))
}

fn controller(store: Arc<MemoryEventStore>) -> PipelineController {
    let mut settings = PipelineConfig::default();
    settings.stop_grace_secs = 2;
    controller_with(store, settings)
}

fn run_config(dir: &Path) -> StreamConfig {
    StreamConfig {
        source_url: "rtsp://127.0.0.1:18554/none".to_string(),
        chunk_duration_secs: 5,
        output_dir: dir.to_path_buf(),
        frames_per_chunk: 9,
        max_frame_height: 720,
        model: "test-model".to_string(),
        base_url: "http://127.0.0.1:19000/v1".to_string(),
        api_key: Some("test".to_string()),
        context: "An empty test scene".to_string(),
    }
}

fn definitions() -> Vec<EventDefinition> {
    vec![EventDefinition {
        event_code: "robot-is-idle".to_string(),
        event_description: "The robot arm is not moving.".to_string(),
        detection_guidelines: "Compare arm position across frames.".to_string(),
    }]
}

#[tokio::test]
async fn start_then_stop_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(Arc::new(MemoryEventStore::new()));

    assert_eq!(ctl.status().state, PipelineState::Idle);

    let run_id = ctl.start(run_config(dir.path()), definitions()).await.unwrap();
    let status = ctl.status();
    assert_eq!(status.state, PipelineState::Running);
    assert_eq!(status.run_id, Some(run_id));

    ctl.stop().await.unwrap();
    let status = ctl.status();
    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.run_id, None);
}

#[tokio::test]
async fn second_start_is_rejected_and_first_run_survives() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(Arc::new(MemoryEventStore::new()));

    let run_id = ctl.start(run_config(dir.path()), definitions()).await.unwrap();

    let err = ctl.start(run_config(dir.path()), definitions()).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning));

    let status = ctl.status();
    assert_eq!(status.state, PipelineState::Running);
    assert_eq!(status.run_id, Some(run_id));

    ctl.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let ctl = controller(Arc::new(MemoryEventStore::new()));
    ctl.stop().await.unwrap();
    ctl.stop().await.unwrap();
    assert_eq!(ctl.status().state, PipelineState::Idle);
}

#[tokio::test]
async fn restart_after_stop_gets_a_new_run_id() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(Arc::new(MemoryEventStore::new()));

    let first = ctl.start(run_config(dir.path()), definitions()).await.unwrap();
    ctl.stop().await.unwrap();
    let second = ctl.start(run_config(dir.path()), definitions()).await.unwrap();
    assert_ne!(first, second);
    ctl.stop().await.unwrap();
}

#[tokio::test]
async fn zero_queue_capacity_still_starts() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = PipelineConfig::default();
    settings.stop_grace_secs = 2;
    settings.queue_capacity = 0;
    let ctl = controller_with(Arc::new(MemoryEventStore::new()), settings);

    ctl.start(run_config(dir.path()), definitions()).await.unwrap();
    assert_eq!(ctl.status().state, PipelineState::Running);
    ctl.stop().await.unwrap();
    assert_eq!(ctl.status().state, PipelineState::Idle);
}

#[tokio::test]
async fn invalid_config_is_rejected_without_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(Arc::new(MemoryEventStore::new()));

    let mut config = run_config(dir.path());
    config.chunk_duration_secs = 0;
    let err = ctl.start(config, definitions()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(ctl.status().state, PipelineState::Idle);

    let err = ctl.start(run_config(dir.path()), Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(ctl.status().state, PipelineState::Idle);
}
