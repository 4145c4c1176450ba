use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::traits::VoiceSession;

#[derive(Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { frames: usize },
    Cancelled { frames: usize },
    TransportFailed { frames: usize, error: Error },
    SourceFailed { frames: usize, error: Error },
}

/// Writes frames into a voice session at real-time cadence.
#[derive(Clone, Debug)]
pub struct FrameStreamer {
    frame_interval: Duration,
    prebuffer: usize,
}

impl FrameStreamer {
    pub fn new(frame_interval: Duration, prebuffer: usize) -> Self {
        Self {
            frame_interval,
            prebuffer,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.frame_interval, config.prebuffer_frames)
    }

    /// Streams `frames` until they run out, `token` is cancelled, the source
    /// fails or the session rejects a write.
    ///
    /// The first `prebuffer` frames (at least one) go out immediately. Every
    /// later frame waits for an absolute deadline measured from the start,
    /// so a slow write never shifts the frames after it. When the source
    /// falls more than a frame behind, the clock restarts from the late
    /// frame instead of bursting to catch up.
    pub async fn stream<S>(
        &self,
        mut frames: S,
        session: &dyn VoiceSession,
        token: &CancellationToken,
    ) -> StreamOutcome
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let lead = self.prebuffer.max(1);
        let mut start = Instant::now();
        let mut sent = 0usize;

        loop {
            if token.is_cancelled() {
                return StreamOutcome::Cancelled { frames: sent };
            }

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamOutcome::Cancelled { frames: sent },
                next = frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => {
                    warn!(frames = sent, error = %error, "audio source failed");
                    return StreamOutcome::SourceFailed {
                        frames: sent,
                        error,
                    };
                }
                None => break,
            };

            if sent >= lead {
                let deadline = start + self.frame_interval * (sent + 1 - lead) as u32;
                let now = Instant::now();

                if now > deadline + self.frame_interval {
                    debug!(frames = sent, late = ?(now - deadline), "source underrun");
                    start += now - deadline;
                } else {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return StreamOutcome::Cancelled { frames: sent },
                        _ = sleep_until(deadline) => {}
                    }
                }
            }

            let written = tokio::select! {
                biased;
                _ = token.cancelled() => return StreamOutcome::Cancelled { frames: sent },
                written = session.send_frame(frame) => written,
            };

            if let Err(error) = written {
                warn!(channel = %session.channel(), frames = sent, error = %error, "voice transport failed");
                return StreamOutcome::TransportFailed {
                    frames: sent,
                    error,
                };
            }

            sent += 1;
        }

        debug!(frames = sent, elapsed = ?start.elapsed(), "stream completed");
        StreamOutcome::Completed { frames: sent }
    }
}
