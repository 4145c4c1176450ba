//! Serenity and songbird bindings for the engine's voice, presence and messaging seams.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use serenity::cache::Cache;
use serenity::http::Http;
use serenity::model::gateway::Activity;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::{Codec, Container, Input, Reader};
use songbird::tracks::TrackHandle;
use songbird::Songbird;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{ChannelRef, TenantId};
use crate::traits::{Notifier, PlaybackEvent, PresenceQuery, VoiceSession, VoiceTransport};

/// Feeds frames to songbird's mixer, playing silence whenever none are queued.
struct PcmReader {
    frames: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl Read for PcmReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            match self.frames.try_recv() {
                Ok(frame) => self.pending = frame,
                Err(TryRecvError::Empty) => {
                    buf.fill(0);
                    return Ok(buf.len());
                }
                Err(TryRecvError::Disconnected) => return Ok(0),
            }
        }

        let len = buf.len().min(self.pending.len());
        buf[..len].copy_from_slice(&self.pending[..len]);
        self.pending.advance(len);

        Ok(len)
    }
}

pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    buffered_frames: usize,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, buffered_frames: usize) -> Self {
        Self {
            manager,
            buffered_frames: buffered_frames.max(1),
        }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn open(&self, tenant: TenantId, channel: ChannelRef) -> Result<Arc<dyn VoiceSession>> {
        let guild_id = GuildId(tenant.0);

        let (handler_lock, joined) = self.manager.join(guild_id, ChannelId(channel.0)).await;
        joined.map_err(|err| Error::VoiceUnavailable(err.to_string()))?;

        let (frames_tx, frames_rx) = mpsc::channel(self.buffered_frames);
        let reader = PcmReader {
            frames: frames_rx,
            pending: Bytes::new(),
        };

        let track = {
            let mut handler = handler_lock.lock().await;

            if handler.is_deaf() {
                info!("Already deafen!")
            } else if let Err(e) = handler.deafen(true).await {
                info!("Deafen failed due to {e:?}")
            }

            let source = Input::new(
                true,
                Reader::Extension(Box::new(reader)),
                Codec::Pcm,
                Container::Raw,
                None,
            );
            handler.play_source(source)
        };

        Ok(Arc::new(SongbirdSession {
            manager: self.manager.clone(),
            guild_id,
            channel,
            frames: frames_tx,
            track,
            closed: AtomicBool::new(false),
        }))
    }
}

struct SongbirdSession {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    channel: ChannelRef,
    frames: mpsc::Sender<Bytes>,
    track: TrackHandle,
    closed: AtomicBool,
}

#[async_trait]
impl VoiceSession for SongbirdSession {
    fn channel(&self) -> ChannelRef {
        self.channel
    }

    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| Error::Transport("voice track is no longer playing".to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.track.stop() {
            warn!(error = ?err, "could not stop voice track");
        }

        if let Err(err) = self.manager.remove(self.guild_id).await {
            warn!(error = ?err, "could not leave voice channel");
        }
    }
}

/// Voice channel occupancy read from serenity's cache.
pub struct CachePresence {
    cache: Arc<Cache>,
}

impl CachePresence {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PresenceQuery for CachePresence {
    async fn occupancy(&self, tenant: TenantId, channel: ChannelRef) -> Result<usize> {
        let guild = self
            .cache
            .guild(GuildId(tenant.0))
            .ok_or_else(|| Error::VoiceUnavailable(format!("guild {tenant} is not cached")))?;

        let channel_id = Some(ChannelId(channel.0));

        Ok(guild
            .voice_states
            .values()
            .filter(|voice_state| voice_state.channel_id == channel_id)
            .count())
    }
}

/// Posts playback messages to the text channel songs were requested from.
pub struct ChannelNotifier {
    http: Arc<Http>,
}

impl ChannelNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

/// Presence shown next to the bot, pointing at the help command.
pub fn status_activity(prefix: &str) -> Activity {
    Activity::listening(format!("{prefix}help"))
}

pub fn playback_message(event: &PlaybackEvent) -> String {
    match event {
        PlaybackEvent::NowPlaying(song) => {
            format!("Playing song [{}]({})", song.human_name(), song.url)
        }
        PlaybackEvent::SongFailed { song, reason } => {
            format!("Could not play {} due to error {}", song.title, reason)
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, channel: ChannelRef, event: PlaybackEvent) {
        if let Err(why) = ChannelId(channel.0).say(&self.http, playback_message(&event)).await {
            info!("Error sending message: {why:?}");
        }
    }
}
