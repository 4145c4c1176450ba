use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Settings the playback engine needs, independent of the chat platform.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum number of resolved media entries kept
    pub metadata_cache_capacity: usize,
    /// Maximum total bytes of cached audio frames
    pub audio_cache_capacity: usize,
    pub frame_interval: Duration,
    /// Frames written ahead of the real-time clock when a song starts
    pub prebuffer_frames: usize,
    /// Frames a live transcode may run ahead of its slowest listener
    pub readahead_frames: usize,
    pub presence_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            metadata_cache_capacity: 512,
            audio_cache_capacity: 256 * 1024 * 1024,
            frame_interval: Duration::from_millis(20),
            prebuffer_frames: 5,
            readahead_frames: 250,
            presence_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub discord_token: String,
    pub command_prefix: String,
    pub playlist_store_dir: Option<PathBuf>,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| Error::Config("DISCORD_TOKEN is not set".to_string()))?;

        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            metadata_cache_capacity: parse_var("METADATA_CACHE_CAPACITY")?
                .unwrap_or(defaults.metadata_cache_capacity),
            audio_cache_capacity: parse_var::<usize>("AUDIO_CACHE_CAPACITY_MB")?
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.audio_cache_capacity),
            frame_interval: parse_var("FRAME_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.frame_interval),
            prebuffer_frames: parse_var("PREBUFFER_FRAMES")?.unwrap_or(defaults.prebuffer_frames),
            readahead_frames: parse_var("READAHEAD_FRAMES")?.unwrap_or(defaults.readahead_frames),
            presence_interval: parse_var("PRESENCE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.presence_interval),
        };

        if engine.frame_interval.is_zero() {
            return Err(Error::Config("FRAME_INTERVAL_MS must be positive".to_string()));
        }
        if engine.readahead_frames == 0 {
            return Err(Error::Config("READAHEAD_FRAMES must be positive".to_string()));
        }

        Ok(Config {
            discord_token,
            command_prefix: var_or("COMMAND_PREFIX", "!"),
            playlist_store_dir: non_empty_var("PLAYLIST_STORE_DIR").map(PathBuf::from),
            ytdlp_path: var_or("YTDLP_PATH", "yt-dlp"),
            ffmpeg_path: var_or("FFMPEG_PATH", "ffmpeg"),
            engine,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    non_empty_var(key).unwrap_or_else(|| default.to_string())
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match non_empty_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(None),
    }
}
