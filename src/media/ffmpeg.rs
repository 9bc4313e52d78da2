use std::io::ErrorKind;
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::DecodeConfig;
use crate::error::{Error, Result};

/// Runs one `ffmpeg` process per decode, feeding MPEG-TS on stdin and
/// reading raw samples from stdout.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    path: String,
    width: u32,
    height: u32,
    sample_rate: u32,
    channels: u16,
}

impl FfmpegDecoder {
    pub fn new(config: &DecodeConfig) -> Self {
        Self {
            path: config.ffmpeg_path.clone(),
            width: config.width,
            height: config.height,
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// RGBA pictures in presentation order.
    pub async fn decode_video(&self, input: Bytes) -> Result<Vec<Bytes>> {
        let scale = format!("scale={}:{}", self.width, self.height);
        let output = self
            .run(
                &[
                    "-map", "0:v:0", "-an", "-vf", &scale, "-fps_mode", "passthrough", "-f",
                    "rawvideo", "-pix_fmt", "rgba",
                ],
                input,
            )
            .await?;
        Ok(split_frames(output, self.frame_size()))
    }

    /// Interleaved samples at the configured rate and channel count.
    pub async fn decode_audio(&self, input: Bytes) -> Result<Vec<f32>> {
        let rate = self.sample_rate.to_string();
        let channels = self.channels.to_string();
        let output = self
            .run(
                &["-map", "0:a:0", "-vn", "-ac", &channels, "-ar", &rate, "-f", "f32le"],
                input,
            )
            .await?;
        Ok(parse_f32le(&output))
    }

    async fn run(&self, output_args: &[&str], input: Bytes) -> Result<Bytes> {
        let mut child = Command::new(&self.path)
            .args(["-hide_banner", "-loglevel", "error", "-f", "mpegts", "-i", "pipe:0"])
            .args(output_args)
            .arg("pipe:1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::FfmpegNotFound,
                _ => Error::Io(e),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::DecodeFailure("ffmpeg stdin unavailable".into()))?;

        // Feed and drain together, ffmpeg blocks on a full stdout pipe.
        let feed = async move {
            if let Err(e) = stdin.write_all(&input).await {
                tracing::trace!(error = %e, "ffmpeg closed stdin early");
            }
            drop(stdin);
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            return Err(Error::DecodeFailure(if message.is_empty() {
                format!("ffmpeg exited with {}", output.status)
            } else {
                message.to_string()
            }));
        }

        Ok(Bytes::from(output.stdout))
    }
}

fn split_frames(mut output: Bytes, frame_size: usize) -> Vec<Bytes> {
    if frame_size == 0 {
        return Vec::new();
    }
    let mut frames = Vec::with_capacity(output.len() / frame_size);
    while output.len() >= frame_size {
        frames.push(output.split_to(frame_size));
    }
    if !output.is_empty() {
        tracing::trace!(trailing = output.len(), "dropping partial frame");
    }
    frames
}

fn parse_f32le(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
