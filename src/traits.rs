//! Seams between the playback engine and the outside world.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::models::{ChannelRef, MediaInfo, PlaylistSnapshot, Song, TenantId};

/// Frames of one song in playback order. An `Err` item ends the song early.
pub type FrameStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait SongLookup: Send + Sync {
    /// Turns user input (URL or free text) into one or more songs.
    ///
    /// A URL naming a video inside a playlist yields that one video unless
    /// `whole_playlist` is set.
    async fn lookup_songs(&self, query: &str, whole_playlist: bool) -> Result<Vec<Song>>;
}

/// Only invoked on cache misses.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn resolve_media(&self, song: &Song) -> Result<MediaInfo>;

    /// Starts producing frames for `media`.
    ///
    /// Fails when the source cannot deliver a first frame. Later failures
    /// arrive as an `Err` item on the stream.
    async fn fetch(&self, media: &MediaInfo) -> Result<FrameStream>;
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn open(&self, tenant: TenantId, channel: ChannelRef) -> Result<Arc<dyn VoiceSession>>;
}

#[async_trait]
pub trait VoiceSession: Send + Sync {
    fn channel(&self) -> ChannelRef;

    async fn send_frame(&self, frame: Bytes) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait PresenceQuery: Send + Sync {
    /// Number of members currently connected to `channel`, the bot included.
    async fn occupancy(&self, tenant: TenantId, channel: ChannelRef) -> Result<usize>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackEvent {
    NowPlaying(Song),
    SongFailed { song: Song, reason: String },
}

/// User-visible messaging for a tenant's text channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: ChannelRef, event: PlaybackEvent);
}

#[async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn load(&self, tenant: TenantId) -> Result<Option<PlaylistSnapshot>>;

    async fn save(&self, tenant: TenantId, snapshot: &PlaylistSnapshot) -> Result<()>;
}

/// Platform lifecycle events, invoked by the platform binding.
#[async_trait]
pub trait TenantEvents: Send + Sync {
    async fn on_tenant_join(&self, tenant: TenantId);

    async fn on_tenant_leave(&self, tenant: TenantId);
}
