use thiserror::Error;

/// Errors raised by the playback engine and its collaborators.
///
/// Cloneable so a single failed fetch can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("Invalid position {position}, the queue has {len} pending songs")]
    InvalidPosition { position: usize, len: usize },

    #[error("Voice transport error: {0}")]
    Transport(String),

    #[error("Cache entry of weight {weight} exceeds capacity {capacity}")]
    CacheCapacityExceeded { weight: usize, capacity: usize },

    #[error("Voice channel unavailable: {0}")]
    VoiceUnavailable(String),

    #[error("Player is closed")]
    PlayerClosed,

    #[error("Playlist store error: {0}")]
    Store(String),

    #[error("Invalid config: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
