use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// API server address
    #[serde(default = "default_api_address")]
    pub address: String,
    /// API server port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    4760
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: default_api_address(),
            port: default_api_port(),
        }
    }
}

/// Database configuration. When no URL is configured (and DATABASE_URL is
/// unset) events are kept in an in-memory store only.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default)]
    pub url: Option<String>,
    /// Connection pool max size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Pipeline tuning knobs that are not part of a single run's StreamConfig
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Capacity of the chunk-path and event queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of concurrent detection workers
    #[serde(default = "default_detector_workers")]
    pub detector_workers: usize,
    /// Attempts per chunk before it is marked detection-failed
    #[serde(default = "default_max_inference_attempts")]
    pub max_inference_attempts: u32,
    /// Per-request inference timeout in seconds
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,
    /// Consecutive source failures before the pipeline reports degraded
    #[serde(default = "default_max_source_retries")]
    pub max_source_retries: u32,
    /// Recorder buffer size; oldest unwritten events beyond this are dropped
    #[serde(default = "default_max_pending_events")]
    pub max_pending_events: usize,
    /// Grace period for workers to drain on stop before forced cancellation
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// On-disk chunk retention
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_queue_capacity() -> usize {
    100
}

fn default_detector_workers() -> usize {
    1
}

fn default_max_inference_attempts() -> u32 {
    3
}

fn default_inference_timeout_secs() -> u64 {
    60
}

fn default_max_source_retries() -> u32 {
    5
}

fn default_max_pending_events() -> usize {
    256
}

fn default_stop_grace_secs() -> u64 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            detector_workers: default_detector_workers(),
            max_inference_attempts: default_max_inference_attempts(),
            inference_timeout_secs: default_inference_timeout_secs(),
            max_source_retries: default_max_source_retries(),
            max_pending_events: default_max_pending_events(),
            stop_grace_secs: default_stop_grace_secs(),
            retention: RetentionConfig::default(),
        }
    }
}

/// Chunk file retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Whether the retention sweeper runs
    pub enabled: bool,
    /// Maximum chunk age in seconds before eviction
    pub max_chunk_age_secs: u64,
    /// Maximum number of chunk files kept on disk
    pub max_chunks_on_disk: usize,
    /// Interval in seconds between sweeps
    pub check_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chunk_age_secs: 900,
            max_chunks_on_disk: 500,
            check_interval_secs: 30,
        }
    }
}

/// An operator-defined event to watch for. Passed verbatim into the model
/// prompt; immutable once a run starts.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EventDefinition {
    pub event_code: String,
    pub event_description: String,
    pub detection_guidelines: String,
}

/// Configuration for a single detection run. Replaced wholesale on
/// reconfiguration (stop + start); never mutated while running.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Live video source (rtsp://, or anything ffmpeg can read)
    pub source_url: String,
    /// Fixed segment duration in seconds
    pub chunk_duration_secs: u64,
    /// Directory chunk files are written to
    pub output_dir: PathBuf,
    /// Frames sampled per chunk for the inference request
    #[serde(default = "default_frames_per_chunk")]
    pub frames_per_chunk: usize,
    /// Height ceiling for sampled frames (never upscaled)
    #[serde(default = "default_max_frame_height")]
    pub max_frame_height: u32,
    /// Model identifier sent to the inference endpoint
    pub model: String,
    /// Inference endpoint base URL
    pub base_url: String,
    /// API key; falls back to the VIGIL_API_KEY environment variable
    #[serde(default)]
    pub api_key: Option<String>,
    /// Scene context given to the model with every request
    pub context: String,
}

fn default_frames_per_chunk() -> usize {
    9
}

fn default_max_frame_height() -> u32 {
    720
}

/// Validate a run configuration before start. All violations here are
/// `Error::Config` and reject the start; nothing is deferred to detection
/// time.
pub fn validate(config: &StreamConfig, definitions: &[EventDefinition]) -> Result<(), Error> {
    if config.source_url.trim().is_empty() {
        return Err(Error::Config("source_url must not be empty".into()));
    }
    if config.chunk_duration_secs == 0 {
        return Err(Error::Config("chunk_duration must be positive".into()));
    }
    if config.frames_per_chunk == 0 {
        return Err(Error::Config("frames_per_chunk must be positive".into()));
    }
    if config.model.trim().is_empty() {
        return Err(Error::Config("model must not be empty".into()));
    }
    if config.base_url.trim().is_empty() {
        return Err(Error::Config("base_url must not be empty".into()));
    }
    if config.context.trim().is_empty() {
        return Err(Error::Config("context must not be empty".into()));
    }
    if definitions.is_empty() {
        return Err(Error::Config(
            "at least one event definition is required".into(),
        ));
    }

    let mut codes = HashSet::new();
    for def in definitions {
        if def.event_code.trim().is_empty() {
            return Err(Error::Config("event_code must not be empty".into()));
        }
        if def.event_description.trim().is_empty() {
            return Err(Error::Config(format!(
                "event {} has an empty description",
                def.event_code
            )));
        }
        if def.detection_guidelines.trim().is_empty() {
            return Err(Error::Config(format!(
                "event {} has empty detection guidelines",
                def.event_code
            )));
        }
        if !codes.insert(def.event_code.as_str()) {
            return Err(Error::Config(format!(
                "duplicate event code: {}",
                def.event_code
            )));
        }
    }

    std::fs::create_dir_all(&config.output_dir).map_err(|e| {
        Error::Config(format!(
            "output directory {:?} is not writable: {}",
            config.output_dir, e
        ))
    })?;

    Ok(())
}

/// Load configuration from a file or use default
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let config_str = std::fs::read_to_string(path)
                .context(format!("Failed to read config file: {:?}", path))?;

            let config = if path.extension().map_or(false, |ext| ext == "json") {
                serde_json::from_str(&config_str).context("Failed to parse JSON config")?
            } else if path.extension().map_or(false, |ext| ext == "toml") {
                toml::from_str(&config_str).context("Failed to parse TOML config")?
            } else {
                return Err(anyhow::anyhow!("Unsupported config file format"));
            };

            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(dir: &Path) -> StreamConfig {
        StreamConfig {
            source_url: "rtsp://127.0.0.1:8554/cam".to_string(),
            chunk_duration_secs: 5,
            output_dir: dir.to_path_buf(),
            frames_per_chunk: 9,
            max_frame_height: 720,
            model: "test-model".to_string(),
            base_url: "http://127.0.0.1:9000/v1".to_string(),
            api_key: None,
            context: "A robot workcell".to_string(),
        }
    }

    fn sample_definition(code: &str) -> EventDefinition {
        EventDefinition {
            event_code: code.to_string(),
            event_description: format!("{} happened", code),
            detection_guidelines: "Judge from the frames only".to_string(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let defs = vec![sample_definition("robot-is-idle")];
        assert!(validate(&config, &defs).is_ok());
    }

    #[test]
    fn test_duplicate_event_code_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let defs = vec![
            sample_definition("robot-is-idle"),
            sample_definition("robot-is-idle"),
        ];
        let err = validate(&config, &defs).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_guidelines_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        let mut def = sample_definition("robot-in-error");
        def.detection_guidelines = "  ".to_string();
        assert!(validate(&config, &[def]).is_err());
    }

    #[test]
    fn test_zero_chunk_duration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config(dir.path());
        config.chunk_duration_secs = 0;
        let defs = vec![sample_definition("robot-is-idle")];
        assert!(validate(&config, &defs).is_err());
    }

    #[test]
    fn test_empty_definitions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path());
        assert!(validate(&config, &[]).is_err());
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.detector_workers, 1);
        assert!(config.retention.enabled);
    }
}
