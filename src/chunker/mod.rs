use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::pipeline::{PipelineMetrics, StateCell};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const RESPAWN_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESPAWN_BACKOFF_CAP: Duration = Duration::from_secs(60);
const QUIT_GRACE: Duration = Duration::from_secs(5);

/// A completed, immutable segment file.
#[derive(Debug, Clone)]
pub struct VideoChunk {
    pub path: PathBuf,
    /// Monotonic segment number, preserved across source reconnects.
    pub sequence: u64,
    /// Wall-clock start of the segment.
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Splits a live source into fixed-duration chunk files and hands every
/// completed file downstream exactly once.
pub struct StreamChunker {
    config: StreamConfig,
    chunk_tx: mpsc::Sender<VideoChunk>,
    metrics: Arc<PipelineMetrics>,
    state: Arc<StateCell>,
    max_source_retries: u32,
}

impl StreamChunker {
    pub fn new(
        config: StreamConfig,
        chunk_tx: mpsc::Sender<VideoChunk>,
        metrics: Arc<PipelineMetrics>,
        state: Arc<StateCell>,
        max_source_retries: u32,
    ) -> Self {
        Self {
            config,
            chunk_tx,
            metrics,
            state,
            max_source_retries,
        }
    }

    fn spawn_ffmpeg(&self, start_number: u64) -> std::io::Result<Child> {
        let pattern = self.config.output_dir.join("chunk_%06d.mp4");
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-loglevel", "error"]);
        if self.config.source_url.starts_with("rtsp://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.arg("-i")
            .arg(&self.config.source_url)
            .args(["-c", "copy", "-f", "segment"])
            .args(["-segment_time", &self.config.chunk_duration_secs.to_string()])
            .args(["-reset_timestamps", "1"])
            .args(["-segment_start_number", &start_number.to_string()])
            .arg(&pattern)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.spawn()
    }

    /// Ask ffmpeg to finish the segment in progress, then wait briefly
    /// before killing it. The partial segment is flushed to disk either way.
    async fn stop_ffmpeg(&self, mut child: Child) {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
        match tokio::time::timeout(QUIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("ffmpeg exited with {}", status),
            Ok(Err(e)) => warn!("ffmpeg wait failed: {}", e),
            Err(_) => {
                warn!("ffmpeg did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }

    /// Enqueue segments we have not handed over yet. Segments numbered below
    /// the highest on disk are complete; the newest one is still being
    /// written unless `include_newest` (source exited or run stopping).
    /// Returns true when at least one new segment was found.
    async fn drain_segments(&self, cursor: &mut u64, include_newest: bool) -> bool {
        let segments = match scan_segments(&self.config.output_dir) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to scan {:?}: {}", self.config.output_dir, e);
                return false;
            }
        };
        let Some(max_seq) = segments.keys().next_back().copied() else {
            return false;
        };

        let mut advanced = false;
        for (seq, path) in segments {
            if seq < *cursor {
                continue;
            }
            if seq == max_seq && !include_newest {
                break;
            }
            *cursor = seq + 1;
            advanced = true;
            self.enqueue(seq, path).await;
        }
        advanced
    }

    async fn enqueue(&self, sequence: u64, path: PathBuf) {
        let duration_secs = self.config.chunk_duration_secs as f64;
        let started_at = segment_start_time(&path, duration_secs);
        let chunk = VideoChunk {
            path: path.clone(),
            sequence,
            started_at,
            duration_secs,
        };
        match self.chunk_tx.try_send(chunk) {
            Ok(()) => debug!("Chunk {} ready: {:?}", sequence, path),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // detection is behind; drop the incoming chunk and its file
                // so disk usage stays bounded
                warn!("Chunk queue full, dropping segment {}", sequence);
                self.metrics.inc_chunks_dropped();
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove dropped segment {:?}: {}", path, e);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Chunk queue closed, segment {} not enqueued", sequence);
            }
        }
    }

    /// Run until cancelled, respawning ffmpeg with exponential backoff when
    /// the source drops. Crossing the retry threshold marks the pipeline
    /// degraded; a successful reconnect clears it.
    pub async fn run(self, cancel: CancellationToken) {
        let mut cursor = next_sequence(&self.config.output_dir);
        let mut consecutive_failures: u32 = 0;

        'outer: loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut child = match self.spawn_ffmpeg(cursor) {
                Ok(child) => {
                    info!(
                        "Chunking {} into {:?} ({}s segments, starting at {})",
                        self.config.source_url, self.config.output_dir,
                        self.config.chunk_duration_secs, cursor
                    );
                    child
                }
                Err(e) => {
                    error!("Failed to spawn ffmpeg: {}", e);
                    if !self.backoff(&mut consecutive_failures, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.stop_ffmpeg(child).await;
                        self.drain_segments(&mut cursor, true).await;
                        break 'outer;
                    }
                    status = child.wait() => {
                        // source dropped; flush whatever completed segments
                        // it left behind, including the last one
                        match status {
                            Ok(s) => warn!("ffmpeg exited unexpectedly: {}", s),
                            Err(e) => warn!("ffmpeg wait failed: {}", e),
                        }
                        self.drain_segments(&mut cursor, true).await;
                        if !self.backoff(&mut consecutive_failures, &cancel).await {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                    _ = tokio::time::sleep(POLL_INTERVAL) => {
                        // only a new completed segment proves the source is
                        // live again; a running ffmpeg may still be stuck in
                        // its connect phase
                        if self.drain_segments(&mut cursor, false).await
                            && consecutive_failures > 0
                        {
                            consecutive_failures = 0;
                            self.state.mark_recovered();
                        }
                    }
                }
            }
        }
        debug!("Chunker stopped");
    }

    /// Sleep with exponential backoff. Returns false when cancelled during
    /// the wait.
    async fn backoff(&self, consecutive_failures: &mut u32, cancel: &CancellationToken) -> bool {
        *consecutive_failures += 1;
        if *consecutive_failures >= self.max_source_retries {
            warn!(
                "Source unavailable after {} attempts, pipeline degraded",
                consecutive_failures
            );
            self.state.mark_degraded();
            self.metrics
                .set_last_error(&format!("Source unavailable: {}", self.config.source_url));
        }
        let wait = RESPAWN_BACKOFF_BASE
            .saturating_mul(1 << (*consecutive_failures - 1).min(16))
            .min(RESPAWN_BACKOFF_CAP);
        debug!("Reconnecting to source in {:?}", wait);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

/// Parse `chunk_NNNNNN.mp4` into its sequence number.
pub(crate) fn parse_sequence(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("chunk_")?;
    let digits = rest.strip_suffix(".mp4")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// All chunk files in a directory, keyed and ordered by sequence.
pub(crate) fn scan_segments(dir: &Path) -> std::io::Result<BTreeMap<u64, PathBuf>> {
    let mut segments = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(seq) = name.to_str().and_then(parse_sequence) {
            segments.insert(seq, entry.path());
        }
    }
    Ok(segments)
}

/// One past the highest sequence already on disk, so restarted runs never
/// overwrite earlier segments.
fn next_sequence(dir: &Path) -> u64 {
    scan_segments(dir)
        .ok()
        .and_then(|s| s.keys().next_back().map(|max| max + 1))
        .unwrap_or(0)
}

/// Approximate segment start: file mtime (write completion) minus the
/// segment duration.
fn segment_start_time(path: &Path, duration_secs: f64) -> DateTime<Utc> {
    let completed: DateTime<Utc> = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    completed - ChronoDuration::milliseconds((duration_secs * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::pipeline::{PipelineMetrics, PipelineState, StateCell};

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("chunk_000042.mp4"), Some(42));
        assert_eq!(parse_sequence("chunk_0.mp4"), Some(0));
        assert_eq!(parse_sequence("chunk_.mp4"), None);
        assert_eq!(parse_sequence("chunk_12.mkv"), None);
        assert_eq!(parse_sequence("segment_12.mp4"), None);
        assert_eq!(parse_sequence("chunk_12a.mp4"), None);
    }

    #[test]
    fn test_scan_segments_orders_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        for seq in [3u64, 0, 7] {
            std::fs::write(dir.path().join(format!("chunk_{:06}.mp4", seq)), b"x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let segments = scan_segments(dir.path()).unwrap();
        let seqs: Vec<u64> = segments.keys().copied().collect();
        assert_eq!(seqs, vec![0, 3, 7]);
    }

    fn test_chunker(
        dir: &Path,
        capacity: usize,
        max_source_retries: u32,
    ) -> (StreamChunker, mpsc::Receiver<VideoChunk>, Arc<StateCell>) {
        let config = StreamConfig {
            source_url: "rtsp://127.0.0.1:18554/none".to_string(),
            chunk_duration_secs: 5,
            output_dir: dir.to_path_buf(),
            frames_per_chunk: 9,
            max_frame_height: 720,
            model: "m".to_string(),
            base_url: "http://127.0.0.1:19000/v1".to_string(),
            api_key: None,
            context: "ctx".to_string(),
        };
        let (tx, rx) = mpsc::channel(capacity);
        let state = Arc::new(StateCell::new());
        let chunker = StreamChunker::new(
            config,
            tx,
            Arc::new(PipelineMetrics::default()),
            state.clone(),
            max_source_retries,
        );
        (chunker, rx, state)
    }

    #[tokio::test]
    async fn test_full_queue_drops_chunk_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("chunk_000000.mp4");
        let second = dir.path().join("chunk_000001.mp4");
        std::fs::write(&first, b"x").unwrap();
        std::fs::write(&second, b"x").unwrap();

        let (chunker, mut rx, _state) = test_chunker(dir.path(), 1, 5);

        chunker.enqueue(0, first.clone()).await;
        chunker.enqueue(1, second.clone()).await;

        // capacity 1: the first segment is queued, the overflowing one is
        // dropped together with its file
        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        assert!(rx.try_recv().is_err());
        assert!(first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_next_sequence_continues_after_existing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_sequence(dir.path()), 0);
        std::fs::write(dir.path().join("chunk_000009.mp4"), b"x").unwrap();
        assert_eq!(next_sequence(dir.path()), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_source_failures_mark_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let (chunker, _rx, state) = test_chunker(dir.path(), 4, 2);
        state.set(PipelineState::Running);
        let cancel = CancellationToken::new();
        let mut failures = 0;

        assert!(chunker.backoff(&mut failures, &cancel).await);
        assert_eq!(state.get(), PipelineState::Running);

        assert!(chunker.backoff(&mut failures, &cancel).await);
        assert_eq!(state.get(), PipelineState::Degraded);
    }

    #[tokio::test]
    async fn test_drain_reports_only_new_segments() {
        let dir = tempfile::tempdir().unwrap();
        for seq in 0..3u64 {
            std::fs::write(dir.path().join(format!("chunk_{:06}.mp4", seq)), b"x").unwrap();
        }
        let (chunker, mut rx, _state) = test_chunker(dir.path(), 8, 5);
        let mut cursor = 0;

        // first pass hands over the completed segments below the newest
        assert!(chunker.drain_segments(&mut cursor, false).await);
        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);

        // nothing new on disk: the idle poll must not look like progress,
        // or a stalled source would never count as failing
        assert!(!chunker.drain_segments(&mut cursor, false).await);
        assert!(rx.try_recv().is_err());

        std::fs::write(dir.path().join("chunk_000003.mp4"), b"x").unwrap();
        assert!(chunker.drain_segments(&mut cursor, false).await);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
    }
}
