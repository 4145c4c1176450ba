//! In-memory collaborators for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::models::{ChannelRef, MediaInfo, Song, TenantId};
use crate::traits::{
    AudioFetcher, FrameStream, Notifier, PlaybackEvent, PresenceQuery, VoiceSession,
    VoiceTransport,
};

pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Produces `frames_per_song` frames per song, each tagged with its media id.
///
/// Stream URLs carry an epoch. Bumping it with `expire_media` makes every
/// URL handed out before rejected, like an expired signed URL.
pub struct FakeFetcher {
    frames_per_song: usize,
    delay: Duration,
    frame_delay: Duration,
    failing: Mutex<HashSet<String>>,
    broken_streams: Mutex<HashMap<String, usize>>,
    epoch: AtomicUsize,
    reject_streams: AtomicBool,
    panic_on_fetch: AtomicBool,
    resolve_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(frames_per_song: usize) -> Self {
        Self {
            frames_per_song,
            delay: Duration::ZERO,
            frame_delay: Duration::ZERO,
            failing: Mutex::new(HashSet::new()),
            broken_streams: Mutex::new(HashMap::new()),
            epoch: AtomicUsize::new(0),
            reject_streams: AtomicBool::new(false),
            panic_on_fetch: AtomicBool::new(false),
            resolve_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Waits `delay` before every frame after the first.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn fail_song(&self, url: &str) {
        self.failing.lock().insert(url.to_string());
    }

    /// The stream for `url` fails after `frames` frames.
    pub fn break_stream(&self, url: &str, frames: usize) {
        self.broken_streams.lock().insert(media_id(url), frames);
    }

    pub fn expire_media(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reject_streams(&self) {
        self.reject_streams.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_next_fetch(&self) {
        self.panic_on_fetch.store(true, Ordering::SeqCst);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

fn media_id(url: &str) -> String {
    format!("media:{}", url.to_lowercase())
}

#[async_trait]
impl AudioFetcher for FakeFetcher {
    async fn resolve_media(&self, song: &Song) -> Result<MediaInfo> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.lock().contains(&song.url) {
            return Err(Error::LookupFailed(format!("no media for {}", song.url)));
        }

        Ok(MediaInfo {
            id: media_id(&song.url),
            stream_url: format!("{}?epoch={}", song.url, self.epoch.load(Ordering::SeqCst)),
        })
    }

    async fn fetch(&self, media: &MediaInfo) -> Result<FrameStream> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_fetch.swap(false, Ordering::SeqCst) {
            panic!("decoder crashed on {}", media.id);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let current = format!("?epoch={}", self.epoch.load(Ordering::SeqCst));
        if self.reject_streams.load(Ordering::SeqCst) || !media.stream_url.ends_with(&current) {
            return Err(Error::TranscodeFailed("403 Forbidden".to_string()));
        }

        let id = media.id.clone();
        let frame_delay = self.frame_delay;
        let broken_after = self.broken_streams.lock().get(&id).copied();

        let frames = stream::iter(0..self.frames_per_song).then(move |index| {
            let id = id.clone();
            async move {
                if index > 0 && !frame_delay.is_zero() {
                    tokio::time::sleep(frame_delay).await;
                }
                if Some(index) == broken_after {
                    return Err(Error::TranscodeFailed(format!("{id} stream reset")));
                }
                Ok(Bytes::from(format!("{id}#{index}")))
            }
        });

        Ok(frames
            .scan(false, |failed, frame| {
                let item = (!*failed).then(|| {
                    *failed = frame.is_err();
                    frame
                });
                future::ready(item)
            })
            .boxed())
    }
}

pub struct FakeSession {
    channel: ChannelRef,
    frames: Mutex<Vec<Bytes>>,
    failing_marker: Mutex<Option<String>>,
    closes: AtomicUsize,
}

impl FakeSession {
    pub fn new(channel: ChannelRef) -> Self {
        Self {
            channel,
            frames: Mutex::new(Vec::new()),
            failing_marker: Mutex::new(None),
            closes: AtomicUsize::new(0),
        }
    }

    /// Rejects every frame whose payload contains `marker`.
    pub fn fail_frames_containing(&self, marker: &str) {
        *self.failing_marker.lock() = Some(marker.to_string());
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    pub fn frames_containing(&self, marker: &str) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|frame| String::from_utf8_lossy(frame).contains(marker))
            .count()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceSession for FakeSession {
    fn channel(&self) -> ChannelRef {
        self.channel
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if let Some(marker) = self.failing_marker.lock().as_deref() {
            if String::from_utf8_lossy(&frame).contains(marker) {
                return Err(Error::Transport("connection reset".to_string()));
            }
        }

        self.frames.lock().push(frame);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeTransport {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    refuse: AtomicBool,
    failing_marker: Mutex<Option<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Sessions opened from now on reject frames containing `marker`.
    pub fn fail_frames_containing(&self, marker: &str) {
        *self.failing_marker.lock() = Some(marker.to_string());
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn open(&self, _tenant: TenantId, channel: ChannelRef) -> Result<Arc<dyn VoiceSession>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::VoiceUnavailable("missing permissions".to_string()));
        }

        let session = Arc::new(FakeSession::new(channel));
        if let Some(marker) = self.failing_marker.lock().as_deref() {
            session.fail_frames_containing(marker);
        }
        self.sessions.lock().push(session.clone());

        Ok(session)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(ChannelRef, PlaybackEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(ChannelRef, PlaybackEvent)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: ChannelRef, event: PlaybackEvent) {
        self.events.lock().push((channel, event));
    }
}

#[derive(Default)]
pub struct FakePresence {
    occupancy: Mutex<HashMap<(TenantId, ChannelRef), usize>>,
    unreachable: Mutex<HashSet<TenantId>>,
    delay: Mutex<Duration>,
}

impl FakePresence {
    pub fn set(&self, tenant: TenantId, channel: ChannelRef, members: usize) {
        self.occupancy.lock().insert((tenant, channel), members);
    }

    pub fn make_unreachable(&self, tenant: TenantId) {
        self.unreachable.lock().insert(tenant);
    }

    /// Every query takes `delay` to answer.
    pub fn respond_after(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl PresenceQuery for FakePresence {
    async fn occupancy(&self, tenant: TenantId, channel: ChannelRef) -> Result<usize> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.unreachable.lock().contains(&tenant) {
            return Err(Error::VoiceUnavailable(format!("guild {tenant} not cached")));
        }

        Ok(self
            .occupancy
            .lock()
            .get(&(tenant, channel))
            .copied()
            .unwrap_or(0))
    }
}
