use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::Error;

/// A single frame sampled from a chunk, ready for an inference request.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// Offset into the chunk, in seconds.
    pub timestamp_secs: f64,
    /// JPEG bytes as a `data:image/jpeg;base64,...` URL.
    pub data_url: String,
}

/// Samples representative frames from a chunk file.
#[async_trait]
pub trait FrameSampler: Send + Sync {
    async fn sample(
        &self,
        path: &Path,
        frames: usize,
        max_height: u32,
    ) -> Result<Vec<SampledFrame>, Error>;
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Frame sampler backed by ffprobe + ffmpeg subprocesses.
pub struct FfmpegFrameSampler;

impl FfmpegFrameSampler {
    pub fn new() -> Self {
        Self
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64, Error> {
        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(path)
            .output()
            .await
            .map_err(|e| Error::Extraction(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Extraction(format!(
                "ffprobe failed for {:?}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Extraction(format!("Invalid ffprobe output: {}", e)))?;

        probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| Error::Extraction(format!("No duration reported for {:?}", path)))
    }

    async fn extract_frame(
        &self,
        path: &Path,
        timestamp_secs: f64,
        max_height: u32,
    ) -> Result<Vec<u8>, Error> {
        // scale filter caps height without ever upscaling; -2 keeps the
        // width divisible by two for the jpeg encoder
        let filter = format!("scale=-2:'min(ih,{})'", max_height);
        let output = Command::new("ffmpeg")
            .arg("-y")
            .args(["-ss", &format!("{:.3}", timestamp_secs)])
            .arg("-i")
            .arg(path)
            .args(["-frames:v", "1"])
            .args(["-vf", &filter])
            .args(["-q:v", "4"])
            .args(["-f", "image2pipe", "-vcodec", "mjpeg", "-"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Extraction(format!("Failed to run ffmpeg: {}", e)))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(Error::Extraction(format!(
                "Frame extraction at {:.3}s failed for {:?}: {}",
                timestamp_secs,
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

impl Default for FfmpegFrameSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSampler for FfmpegFrameSampler {
    async fn sample(
        &self,
        path: &Path,
        frames: usize,
        max_height: u32,
    ) -> Result<Vec<SampledFrame>, Error> {
        let duration = self.probe_duration(path).await?;
        let timestamps = sample_timestamps(duration, frames)?;
        debug!(
            "Sampling {} frames from {:?} ({:.2}s)",
            timestamps.len(),
            path,
            duration
        );

        let mut sampled = Vec::with_capacity(timestamps.len());
        for ts in timestamps {
            let jpeg = self.extract_frame(path, ts, max_height).await?;
            sampled.push(SampledFrame {
                timestamp_secs: ts,
                data_url: encode_data_url(&jpeg),
            });
        }
        Ok(sampled)
    }
}

/// Deterministic sample points: midpoints of equal slices of the chunk.
/// The effective frame count never exceeds the whole seconds available, so
/// short chunks yield fewer frames rather than near-duplicate ones.
pub fn sample_timestamps(duration_secs: f64, frames: usize) -> Result<Vec<f64>, Error> {
    if !duration_secs.is_finite() || duration_secs < 1.0 {
        return Err(Error::Extraction(format!(
            "Chunk too short to sample: {:.3}s",
            duration_secs
        )));
    }
    let effective = frames.min(duration_secs.floor() as usize).max(1);
    let slice = duration_secs / effective as f64;
    Ok((0..effective).map(|i| (i as f64 + 0.5) * slice).collect())
}

/// Encode JPEG bytes as a data URL accepted by chat-completions image parts.
pub fn encode_data_url(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_slice_midpoints() {
        let ts = sample_timestamps(10.0, 5).unwrap();
        assert_eq!(ts, vec![1.0, 3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_short_chunk_caps_frame_count() {
        let ts = sample_timestamps(3.4, 9).unwrap();
        assert_eq!(ts.len(), 3);
        assert!(ts.iter().all(|t| *t > 0.0 && *t < 3.4));
    }

    #[test]
    fn test_timestamps_deterministic() {
        assert_eq!(
            sample_timestamps(7.2, 4).unwrap(),
            sample_timestamps(7.2, 4).unwrap()
        );
    }

    #[test]
    fn test_sub_second_chunk_rejected() {
        assert!(sample_timestamps(0.4, 9).is_err());
        assert!(sample_timestamps(f64::NAN, 9).is_err());
    }

    #[test]
    fn test_data_url_prefix() {
        let url = encode_data_url(&[0xFF, 0xD8, 0xFF]);
        assert!(url.starts_with("data:image/jpeg;base64,"));
        assert!(url.len() > "data:image/jpeg;base64,".len());
    }
}
