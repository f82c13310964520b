//! First-frame extraction by shelling out to ffmpeg.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProcessError;
use crate::pipeline::FrameExtractor;

/// Extracts the first decoded frame of a video as JPEG via an `ffmpeg`
/// subprocess. Media and frame go through scratch files in a temp
/// directory that is removed when the call returns.
pub struct FfmpegFrameExtractor {
    ffmpeg_path: String,
}

impl FfmpegFrameExtractor {
    pub fn new(ffmpeg_path: &str) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_owned(),
        }
    }
}

impl Default for FfmpegFrameExtractor {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn first_frame(&self, video: &[u8]) -> Result<Vec<u8>, ProcessError> {
        let scratch = tempfile::Builder::new()
            .prefix("clip-frames-")
            .tempdir()
            .map_err(|e| ProcessError::Format(format!("failed to create temp dir: {e}")))?;

        let input_path = scratch.path().join("input.mp4");
        let output_path = scratch.path().join("frame.jpg");

        tokio::fs::write(&input_path, video)
            .await
            .map_err(|e| ProcessError::Format(format!("failed to write video bytes: {e}")))?;

        let output = Command::new(&self.ffmpeg_path)
            .arg("-i")
            .arg(&input_path)
            .args(["-frames:v", "1", "-f", "image2", "-y"])
            .arg(&output_path)
            .output()
            .await
            .map_err(|e| ProcessError::Format(format!("failed to run ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().last().unwrap_or("no error details").to_owned();
            return Err(ProcessError::Format(format!(
                "ffmpeg exited with {}: {}",
                output.status, tail
            )));
        }

        let frame = tokio::fs::read(&output_path)
            .await
            .map_err(|e| ProcessError::Format(format!("failed to read extracted frame: {e}")))?;
        if frame.is_empty() {
            return Err(ProcessError::Format(
                "ffmpeg produced an empty frame".to_owned(),
            ));
        }

        debug!("extracted first frame ({} bytes)", frame.len());
        Ok(frame)
    }
}
