use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub title: String,
    pub url: String,
    pub duration: Option<Duration>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl Song {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Song {
            title: title.into(),
            url: url.into(),
            duration: None,
            thumbnail_url: None,
            requested_by: None,
        }
    }

    pub fn requested_by(mut self, name: impl Into<String>) -> Self {
        self.requested_by = Some(name.into());
        self
    }

    /// Title followed by the `m:ss` duration when it is known.
    pub fn human_name(&self) -> String {
        match self.duration {
            Some(duration) => format!("{} ({})", self.title, fmt_duration(duration)),
            None => self.title.clone(),
        }
    }
}

pub fn fmt_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let minutes = seconds / 60;
    let display_seconds = seconds - (minutes * 60);

    format!("{minutes}:{display_seconds:0>2}")
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loading,
    Playing,
    Closed,
}

/// Durable form of a tenant's pending queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    pub text_channel: Option<ChannelRef>,
    pub voice_channel: Option<ChannelRef>,
    pub songs: Vec<Song>,
}

/// Media resolved for a song, kept in the metadata cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaInfo {
    pub id: String,
    pub stream_url: String,
}

/// A complete song held in memory, frames shared between every replay.
#[derive(Clone, Debug)]
pub struct AudioTrack {
    frames: Arc<[Bytes]>,
}

impl AudioTrack {
    pub fn new(frames: Vec<Bytes>) -> Self {
        AudioTrack {
            frames: frames.into(),
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = Bytes> + Send + 'static {
        let frames = self.frames.clone();
        (0..frames.len()).map(move |index| frames[index].clone())
    }

    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_name_includes_duration() {
        let song = Song {
            duration: Some(Duration::from_secs(125)),
            ..Song::new("Intro", "https://youtu.be/a")
        };
        assert_eq!(song.human_name(), "Intro (2:05)");
        assert_eq!(Song::new("Outro", "x").human_name(), "Outro");
    }

    #[test]
    fn audio_track_frames_are_lazy_and_shared() {
        let track = AudioTrack::new(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")]);
        let copy = track.clone();
        drop(track);

        assert_eq!(copy.byte_len(), 5);
        assert_eq!(copy.frames().collect::<Vec<_>>()[1], Bytes::from_static(b"cde"));
    }
}
