//! yt-dlp + ffmpeg audio fetching.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::process::{ChildStderr, Command};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{MediaInfo, Song};
use crate::traits::{AudioFetcher, FrameStream};

pub const SAMPLE_RATE: usize = 48_000;
pub const CHANNELS: usize = 2;
const BYTES_PER_SAMPLE: usize = 2;

/// ffmpeg error lines kept for the failure message.
const STDERR_LINES: usize = 5;

/// Bytes of interleaved 16-bit stereo PCM covering `interval`.
pub fn frame_bytes(interval: Duration) -> usize {
    let samples = SAMPLE_RATE as u128 * interval.as_micros() / 1_000_000;
    samples as usize * CHANNELS * BYTES_PER_SAMPLE
}

/// Cuts raw PCM into fixed-size frames, padding the last one with silence.
pub struct PcmFrameCodec {
    frame_size: usize,
}

impl PcmFrameCodec {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl Decoder for PcmFrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < self.frame_size {
            src.reserve(self.frame_size - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(self.frame_size).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let mut last = src.split();
        last.resize(self.frame_size, 0);
        Ok(Some(last.freeze()))
    }
}

/// Last few lines ffmpeg wrote to stderr.
async fn collect_stderr(stderr: ChildStderr) -> String {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(4096));
    let mut tail: Vec<String> = Vec::new();

    while let Some(Ok(line)) = lines.next().await {
        if tail.len() == STDERR_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }

    tail.join(" | ")
}

#[derive(Deserialize)]
struct MediaDescription {
    id: String,
    extractor: Option<String>,
    url: String,
}

pub struct YtDlpFetcher {
    ytdlp_path: String,
    ffmpeg_path: String,
    frame_interval: Duration,
}

impl YtDlpFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            ytdlp_path: config.ytdlp_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            frame_interval: config.engine.frame_interval,
        }
    }
}

#[async_trait]
impl AudioFetcher for YtDlpFetcher {
    async fn resolve_media(&self, song: &Song) -> Result<MediaInfo> {
        let output = Command::new(&self.ytdlp_path)
            .args(["-j", "--no-playlist", "-f", "bestaudio/best"])
            .arg(&song.url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| Error::LookupFailed(format!("yt-dlp failed to start: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::LookupFailed(format!("{}: {}", song.url, stderr.trim())));
        }

        let description: MediaDescription = serde_json::from_slice(&output.stdout)
            .map_err(|err| Error::LookupFailed(format!("unreadable yt-dlp output: {err}")))?;

        Ok(MediaInfo {
            id: format!(
                "{}:{}",
                description.extractor.as_deref().unwrap_or("generic"),
                description.id
            ),
            stream_url: description.url,
        })
    }

    async fn fetch(&self, media: &MediaInfo) -> Result<FrameStream> {
        info!(media = %media.id, "transcoding audio");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"])
            .args(["-loglevel", "error", "-i"])
            .arg(&media.stream_url)
            .args(["-vn", "-f", "s16le", "-ar", "48000", "-ac", "2", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::TranscodeFailed(format!("ffmpeg failed to start: {err}")))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Error::TranscodeFailed("ffmpeg pipes unavailable".to_string()));
        };
        let errors = tokio::spawn(collect_stderr(stderr));

        let mut frames = FramedRead::new(stdout, PcmFrameCodec::new(frame_bytes(self.frame_interval)));

        let first = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(Error::TranscodeFailed(format!("{}: {err}", media.id))),
            None => {
                let _ = child.wait().await;
                let stderr = errors.await.unwrap_or_default();
                return Err(Error::TranscodeFailed(format!("{} produced no audio: {stderr}", media.id)));
            }
        };

        let id = media.id.clone();
        let rest = frames.map(|frame| frame.map_err(|err| Error::TranscodeFailed(err.to_string())));

        // Checked once stdout is exhausted, so a crash mid-song is not mistaken for its end.
        let exit = stream::once(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(media = %id, "transcode finished");
                    None
                }
                Ok(status) => {
                    let stderr = errors.await.unwrap_or_default();
                    Some(Err(Error::TranscodeFailed(format!("{id}: ffmpeg {status}: {stderr}"))))
                }
                Err(err) => Some(Err(Error::TranscodeFailed(format!("{id}: {err}")))),
            }
        })
        .filter_map(future::ready);

        Ok(stream::once(future::ready(Ok(first)))
            .chain(rest)
            .chain(exit)
            .boxed())
    }
}
