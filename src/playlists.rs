use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::Song;
use crate::traits::SongLookup;

const UNKNOWN_TRACK_TITLE: &str = "UNKNOWN TRACK";

/// One line of `yt-dlp -j` output, either a full video or a flat playlist entry.
#[derive(Deserialize)]
pub struct YtDlpEntry {
    pub title: Option<String>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Deserialize)]
pub struct Thumbnail {
    pub url: String,
}

impl YtDlpEntry {
    fn into_song(self) -> Option<Song> {
        let url = self.webpage_url.or(self.url)?;

        let duration = self
            .duration
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .map(Duration::from_secs_f64);

        let thumbnail_url = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().last().map(|thumbnail| thumbnail.url));

        Some(Song {
            title: self.title.unwrap_or_else(|| UNKNOWN_TRACK_TITLE.to_string()),
            url,
            duration,
            thumbnail_url,
            requested_by: None,
        })
    }
}

/// Parses newline-delimited yt-dlp JSON, skipping lines that do not describe a song.
pub fn songs_from_ytdlp_output(output: &str) -> Vec<Song> {
    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    let songs: Vec<Song> = lines
        .iter()
        .filter_map(|line| serde_json::from_str::<YtDlpEntry>(line).ok())
        .filter_map(YtDlpEntry::into_song)
        .collect();

    if songs.len() < lines.len() {
        warn!("Some songs have been skipped due to errors during parsing");
    }

    songs
}

/// How a lookup query is handed to yt-dlp.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LookupMode {
    Search,
    Single,
    Playlist,
}

struct UrlParts {
    has_list: bool,
    has_video: bool,
}

fn url_parts(input: &str) -> Option<UrlParts> {
    if !input.starts_with("http") {
        return None;
    }

    let query = input.split_once('?').map(|(_, query)| query).unwrap_or_default();
    let names: Vec<&str> = query
        .split('&')
        .map(|param| param.split('=').next().unwrap_or(param))
        .collect();

    Some(UrlParts {
        has_list: names.contains(&"list"),
        has_video: names.contains(&"v") || input.contains("youtu.be/"),
    })
}

/// A URL pointing at one video inside a playlist.
pub fn is_song_in_playlist(input: &str) -> bool {
    url_parts(input).map_or(false, |parts| parts.has_list && parts.has_video)
}

/// A video URL inside a playlist is one song unless `whole_playlist` is asked for.
pub fn lookup_mode(input: &str, whole_playlist: bool) -> LookupMode {
    match url_parts(input) {
        None => LookupMode::Search,
        Some(parts) if parts.has_list && (whole_playlist || !parts.has_video) => LookupMode::Playlist,
        Some(_) => LookupMode::Single,
    }
}

/// Splits a trailing `playlist` keyword off a URL.
pub fn split_playlist_keyword(input: &str) -> (&str, bool) {
    let input = input.trim();

    match input.rsplit_once(char::is_whitespace) {
        Some((url, keyword)) if keyword.eq_ignore_ascii_case("playlist") && url.starts_with("http") => {
            (url.trim_end(), true)
        }
        _ => (input, false),
    }
}

/// Looks songs up by running `yt-dlp`.
pub struct YtDlpLookup {
    ytdlp_path: String,
}

impl YtDlpLookup {
    pub fn new(ytdlp_path: impl Into<String>) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
        }
    }
}

#[async_trait]
impl SongLookup for YtDlpLookup {
    async fn lookup_songs(&self, query: &str, whole_playlist: bool) -> Result<Vec<Song>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::LookupFailed("empty query".to_string()));
        }

        let mut command = Command::new(&self.ytdlp_path);
        command.arg("-j");

        match lookup_mode(query, whole_playlist) {
            LookupMode::Playlist => {
                info!("Detected playlist in {query}");
                command.arg("--flat-playlist").arg(query);
            }
            LookupMode::Single => {
                command.arg("--no-playlist").arg(query);
            }
            LookupMode::Search => {
                command.arg("--no-playlist").arg(format!("ytsearch1:{query}"));
            }
        }

        let output = command
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| Error::LookupFailed(format!("yt-dlp failed to start: {err}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let songs = songs_from_ytdlp_output(&stdout);

        if songs.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::LookupFailed(format!(
                "no results for {query}: {}",
                stderr.trim()
            )));
        }

        Ok(songs)
    }
}
