use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::chunker::VideoChunk;
use crate::config::{EventDefinition, StreamConfig};
use crate::db::models::DetectedEvent;
use crate::error::Error;
use crate::extractor::FrameSampler;
use crate::pipeline::PipelineMetrics;

const SYSTEM_PROMPT: &str = "You are a video analytics agent specialized in factual event detection.\n\
Your task is to determine, based strictly on visual and contextual evidence, \
whether specific events occurred in the video.\n\
Do not infer or assume beyond what is clearly supported by the video and context.\n\
Use only the visual content and the following context when making determinations: \
{context}\n\
Format your response as JSON.";

const USER_PROMPT: &str = "Based on the sequence of frames and the provided context, analyze whether \
the following events occurred. Respond with a factual assessment of each event:\n\
{events_list}";

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    response_format: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatMessage {
    Text { role: &'static str, content: String },
    Parts { role: &'static str, content: Vec<ContentPart> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerdictEnvelope {
    events: Vec<RawVerdict>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    event_code: Option<String>,
    #[serde(default)]
    detected: bool,
    #[serde(default)]
    explanation: String,
}

/// A confirmed per-event verdict from one inference round.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub event_code: String,
    pub explanation: String,
}

/// Sends a prepared frame sequence to a vision model and returns the raw
/// message content.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(&self, request: &InferenceRequest) -> Result<String, Error>;
}

/// Everything needed for one chat-completions call.
#[derive(Debug)]
pub struct InferenceRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub frame_data_urls: Vec<String>,
}

fn response_schema() -> Value {
    json!({
        "schema": {
            "type": "object",
            "properties": {
                "events": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "event_code": {"type": "string"},
                            "detected": {"type": "boolean"},
                            "explanation": {"type": "string"}
                        },
                        "required": ["event_code", "detected", "explanation"]
                    }
                }
            },
            "required": ["events"]
        }
    })
}

/// OpenAI-compatible chat-completions client.
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete(&self, request: &InferenceRequest) -> Result<String, Error> {
        let mut content = vec![ContentPart::Text {
            text: request.user_prompt.clone(),
        }];
        for url in &request.frame_data_urls {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl { url: url.clone() },
            });
        }

        let body = ChatRequest {
            model: request.model.clone(),
            messages: vec![
                ChatMessage::Text {
                    role: "system",
                    content: request.system_prompt.clone(),
                },
                ChatMessage::Parts {
                    role: "user",
                    content,
                },
            ],
            response_format: json!({
                "type": "json_schema",
                "json_schema": response_schema(),
            }),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                Error::InferenceTransient(format!("Request to {} failed: {}", url, e))
            } else {
                Error::InferenceTransient(format!("Request error: {}", e))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::InferenceTransient(format!(
                "Inference endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(Error::InferenceParse(format!(
                "Inference endpoint returned {}",
                status
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::InferenceParse(format!("Invalid completion body: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::InferenceParse("Completion had no message content".into()))
    }
}

/// Render the per-event list the model is asked to judge.
pub fn build_events_list(definitions: &[EventDefinition]) -> String {
    definitions
        .iter()
        .map(|d| {
            format!(
                "- {}: {} {}",
                d.event_code, d.event_description, d.detection_guidelines
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_system_prompt(context: &str) -> String {
    SYSTEM_PROMPT.replace("{context}", context)
}

pub fn build_user_prompt(definitions: &[EventDefinition]) -> String {
    USER_PROMPT.replace("{events_list}", &build_events_list(definitions))
}

/// Parse the model's verdicts defensively. Unknown codes are discarded,
/// repeated codes keep the first occurrence, and a code absent from the
/// response counts as not detected. A payload that is not the expected
/// envelope at all is an `InferenceParse` error.
pub fn parse_verdicts(
    content: &str,
    definitions: &[EventDefinition],
) -> Result<Vec<Verdict>, Error> {
    let envelope: VerdictEnvelope = serde_json::from_str(content)
        .map_err(|e| Error::InferenceParse(format!("Verdict payload not parseable: {}", e)))?;

    let known: HashSet<&str> = definitions.iter().map(|d| d.event_code.as_str()).collect();
    let mut seen = HashSet::new();
    let mut verdicts = Vec::new();

    for raw in envelope.events {
        let code = match raw.event_code {
            Some(c) => c,
            None => {
                warn!("Verdict without an event_code discarded");
                continue;
            }
        };
        if !known.contains(code.as_str()) {
            warn!("Verdict for unknown event code {} discarded", code);
            continue;
        }
        if !seen.insert(code.clone()) {
            debug!("Duplicate verdict for {} ignored", code);
            continue;
        }
        if raw.detected {
            verdicts.push(Verdict {
                event_code: code,
                explanation: raw.explanation,
            });
        }
    }

    Ok(verdicts)
}

/// Worker that turns completed chunks into recorded events.
pub struct EventDetector {
    config: StreamConfig,
    definitions: Vec<EventDefinition>,
    sampler: Arc<dyn FrameSampler>,
    client: Arc<dyn InferenceClient>,
    event_tx: mpsc::Sender<DetectedEvent>,
    metrics: Arc<PipelineMetrics>,
    max_attempts: u32,
}

impl EventDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StreamConfig,
        definitions: Vec<EventDefinition>,
        sampler: Arc<dyn FrameSampler>,
        client: Arc<dyn InferenceClient>,
        event_tx: mpsc::Sender<DetectedEvent>,
        metrics: Arc<PipelineMetrics>,
        max_attempts: u32,
    ) -> Self {
        Self {
            config,
            definitions,
            sampler,
            client,
            event_tx,
            metrics,
            max_attempts,
        }
    }

    /// Pull chunks FIFO from the shared receiver until cancelled. Several
    /// workers may share one receiver; the lock is held only across recv.
    pub async fn run(
        self: Arc<Self>,
        chunk_rx: Arc<Mutex<mpsc::Receiver<VideoChunk>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let chunk = {
                let mut rx = chunk_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    chunk = rx.recv() => chunk,
                }
            };

            let chunk = match chunk {
                Some(c) => c,
                None => break,
            };

            if self.process_chunk(&chunk, &cancel).await {
                self.metrics.inc_chunks_processed();
            }
        }
        debug!("Detection worker stopped");
    }

    /// Returns true when the chunk went through detection (with or without
    /// matches); false when it was dropped before a verdict.
    async fn process_chunk(&self, chunk: &VideoChunk, cancel: &CancellationToken) -> bool {
        let frames = match self
            .sampler
            .sample(
                &chunk.path,
                self.config.frames_per_chunk,
                self.config.max_frame_height,
            )
            .await
        {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => {
                warn!("No frames sampled from {:?}, skipping chunk", chunk.path);
                self.metrics.inc_chunks_dropped();
                return false;
            }
            Err(e) => {
                error!("Frame sampling failed for {:?}: {}", chunk.path, e);
                self.metrics.inc_chunks_dropped();
                self.metrics.set_last_error(&e.to_string());
                return false;
            }
        };

        let request = InferenceRequest {
            model: self.config.model.clone(),
            system_prompt: build_system_prompt(&self.config.context),
            user_prompt: build_user_prompt(&self.definitions),
            frame_data_urls: frames.into_iter().map(|f| f.data_url).collect(),
        };

        let content = match self.complete_with_retry(&request, cancel).await {
            Some(content) => content,
            None => {
                self.metrics.inc_chunks_dropped();
                return false;
            }
        };

        let verdicts = match parse_verdicts(&content, &self.definitions) {
            Ok(v) => v,
            Err(e) => {
                // an unparseable verdict is treated as no detections for
                // this chunk, never as a pipeline failure
                warn!("Discarding verdicts for {:?}: {}", chunk.path, e);
                self.metrics.set_last_error(&e.to_string());
                return true;
            }
        };

        for verdict in verdicts {
            let def = self
                .definitions
                .iter()
                .find(|d| d.event_code == verdict.event_code);
            let def = match def {
                Some(d) => d,
                None => continue,
            };

            let event = DetectedEvent {
                event_timestamp: chunk.started_at,
                event_code: verdict.event_code.clone(),
                event_description: def.event_description.clone(),
                detection_guidelines: def.detection_guidelines.clone(),
                event_video_url: chunk.path.to_string_lossy().to_string(),
                event_detection_explanation_by_ai: verdict.explanation,
            };

            match self.event_tx.try_send(event) {
                Ok(()) => {
                    info!(
                        "Detected {} in chunk {} ({:?})",
                        verdict.event_code, chunk.sequence, chunk.path
                    );
                    self.metrics.inc_events_detected();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Event queue full, dropping {}", verdict.event_code);
                    self.metrics.inc_events_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Event queue closed, dropping {}", verdict.event_code);
                    return true;
                }
            }
        }
        true
    }

    /// Retry transient inference failures with exponential backoff, up to
    /// the configured attempt cap. Returns None when the chunk should be
    /// counted as detection-failed.
    async fn complete_with_retry(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Option<String> {
        for attempt in 1..=self.max_attempts {
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.client.complete(request) => result,
            };
            match result {
                Ok(content) => return Some(content),
                Err(e @ Error::InferenceTransient(_)) => {
                    warn!(
                        "Inference attempt {}/{} failed: {}",
                        attempt, self.max_attempts, e
                    );
                    self.metrics.set_last_error(&e.to_string());
                    if attempt == self.max_attempts {
                        error!("Giving up on chunk after {} attempts", self.max_attempts);
                        return None;
                    }
                    let backoff = Duration::from_millis(
                        BACKOFF_BASE_MS.saturating_mul(1 << (attempt - 1).min(16)),
                    )
                    .min(BACKOFF_CAP);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    // non-transient failures (bad payload shape, auth) do
                    // not retry; the chunk is counted as failed
                    error!("Inference failed: {}", e);
                    self.metrics.set_last_error(&e.to_string());
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<EventDefinition> {
        vec![
            EventDefinition {
                event_code: "robot-is-idle".into(),
                event_description: "The robot arm is not moving.".into(),
                detection_guidelines: "Compare arm position across frames.".into(),
            },
            EventDefinition {
                event_code: "robot-in-error".into(),
                event_description: "The status light is red.".into(),
                detection_guidelines: "Look at the tower light.".into(),
            },
        ]
    }

    #[test]
    fn test_system_prompt_carries_context() {
        let prompt = build_system_prompt("A packaging line");
        assert!(prompt.contains("A packaging line"));
        assert!(!prompt.contains("{context}"));
    }

    #[test]
    fn test_user_prompt_lists_every_event() {
        let prompt = build_user_prompt(&defs());
        assert!(prompt.contains("- robot-is-idle: The robot arm is not moving."));
        assert!(prompt.contains("- robot-in-error: The status light is red."));
        assert!(!prompt.contains("{events_list}"));
    }

    #[test]
    fn test_parse_keeps_only_detected() {
        let content = r#"{"events":[
            {"event_code":"robot-is-idle","detected":true,"explanation":"arm static"},
            {"event_code":"robot-in-error","detected":false,"explanation":"light green"}
        ]}"#;
        let verdicts = parse_verdicts(content, &defs()).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].event_code, "robot-is-idle");
        assert_eq!(verdicts[0].explanation, "arm static");
    }

    #[test]
    fn test_parse_discards_unknown_codes() {
        let content = r#"{"events":[
            {"event_code":"made-up","detected":true,"explanation":"x"}
        ]}"#;
        let verdicts = parse_verdicts(content, &defs()).unwrap();
        assert!(verdicts.is_empty());
    }

    #[test]
    fn test_parse_first_verdict_wins_on_duplicates() {
        let content = r#"{"events":[
            {"event_code":"robot-is-idle","detected":true,"explanation":"first"},
            {"event_code":"robot-is-idle","detected":false,"explanation":"second"}
        ]}"#;
        let verdicts = parse_verdicts(content, &defs()).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].explanation, "first");
    }

    #[test]
    fn test_parse_defaults_missing_fields() {
        // detected and explanation may be absent; absence means no match
        let content = r#"{"events":[{"event_code":"robot-is-idle"}]}"#;
        let verdicts = parse_verdicts(content, &defs()).unwrap();
        assert!(verdicts.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_envelope() {
        assert!(parse_verdicts("not json", &defs()).is_err());
        assert!(parse_verdicts(r#"{"detections":[]}"#, &defs()).is_err());
    }

    #[test]
    fn test_verdict_without_code_discarded() {
        let content = r#"{"events":[{"detected":true,"explanation":"x"}]}"#;
        let verdicts = parse_verdicts(content, &defs()).unwrap();
        assert!(verdicts.is_empty());
    }
}
