//! Resolves songs into frame streams, through the caches when possible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::buffer::{TrackBuffer, TrackReader, TrackWriter};
use crate::cache::{Cache, Weighted};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::models::{AudioTrack, MediaInfo, Song};
use crate::traits::{AudioFetcher, FrameStream};

pub const METADATA_CACHE: &str = "metadata_cache";
pub const AUDIO_CACHE: &str = "audio_cache";

/// Query parameters that do not change which media a URL points at.
const IGNORED_QUERY_PARAMS: [&str; 6] = ["si", "feature", "pp", "list", "index", "t"];

/// A song ready to be streamed.
pub enum AudioSource {
    Cached(AudioTrack),
    Live(TrackReader),
}

impl AudioSource {
    pub fn into_frames(self) -> FrameStream {
        match self {
            AudioSource::Cached(track) => stream::iter(track.frames().map(Ok)).boxed(),
            AudioSource::Live(reader) => reader.into_stream(),
        }
    }
}

#[derive(Clone)]
enum Start {
    Cached(AudioTrack),
    Live,
}

type StartFuture = Shared<BoxFuture<'static, Result<Start>>>;

enum Opened {
    Cached(AudioTrack),
    Live(MediaInfo, FrameStream),
}

/// One resolve shared by every caller asking for the same key.
struct Flight {
    id: u64,
    buffer: TrackBuffer,
    started: StartFuture,
}

impl Flight {
    fn join(&self) -> Option<(StartFuture, TrackReader)> {
        Some((self.started.clone(), self.buffer.reader()?))
    }
}

/// Forgets its flight when the fetch task ends, however it ends.
struct FlightGuard {
    pipeline: Arc<AudioPipeline>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.pipeline.in_flight.lock();
        if in_flight.get(&self.key).map(|flight| flight.id) == Some(self.id) {
            in_flight.remove(&self.key);
        }
    }
}

pub struct AudioPipeline {
    fetcher: Arc<dyn AudioFetcher>,
    metadata: Cache<MediaInfo>,
    audio: Cache<AudioTrack>,
    readahead: usize,
    in_flight: Mutex<HashMap<String, Flight>>,
    next_flight: AtomicU64,
}

impl AudioPipeline {
    pub fn new(
        fetcher: Arc<dyn AudioFetcher>,
        config: &EngineConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            fetcher,
            metadata: Cache::new(METADATA_CACHE, config.metadata_cache_capacity, metrics.clone()),
            audio: Cache::new(AUDIO_CACHE, config.audio_cache_capacity, metrics),
            readahead: config.readahead_frames,
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    pub fn metadata_cache(&self) -> &Cache<MediaInfo> {
        &self.metadata
    }

    pub fn audio_cache(&self) -> &Cache<AudioTrack> {
        &self.audio
    }

    /// Resolves `song` into its frames.
    ///
    /// Concurrent calls for the same normalized key share one underlying
    /// fetch, and every caller receives the same frames or the same error.
    /// The fetch runs on its own task, so a caller that stops waiting does
    /// not abort it for the others. A live song is handed out frame by frame
    /// as the transcode produces it.
    pub async fn resolve(self: &Arc<Self>, song: &Song) -> Result<AudioSource> {
        let key = normalize_key(&song.url);

        let joined = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key).and_then(Flight::join) {
                Some(joined) => {
                    debug!(key = %key, "joining in-flight resolve");
                    Some(joined)
                }
                None => {
                    let flight = self.spawn_resolve(key.clone(), song.clone());
                    let joined = flight.join();
                    in_flight.insert(key, flight);
                    joined
                }
            }
        };

        let (started, reader) = joined
            .ok_or_else(|| Error::TranscodeFailed("audio buffer released before playback".to_string()))?;

        match started.await? {
            Start::Cached(track) => Ok(AudioSource::Cached(track)),
            Start::Live => Ok(AudioSource::Live(reader)),
        }
    }

    /// Called with the in-flight lock held, so the guard cannot run before
    /// the flight is registered.
    fn spawn_resolve(self: &Arc<Self>, key: String, song: Song) -> Flight {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (buffer, writer) = TrackBuffer::new(self.audio.capacity(), self.readahead);
        let (started_tx, started_rx) = oneshot::channel();

        let guard = FlightGuard {
            pipeline: Arc::clone(self),
            key,
            id,
        };

        tokio::spawn(async move {
            let pipeline = Arc::clone(&guard.pipeline);
            pipeline.run_flight(&guard.key, &song, writer, started_tx).await;
            drop(guard);
        });

        let started = async move {
            started_rx
                .await
                .unwrap_or_else(|_| Err(Error::TranscodeFailed("audio task stopped unexpectedly".to_string())))
        }
        .boxed()
        .shared();

        Flight { id, buffer, started }
    }

    async fn run_flight(
        &self,
        key: &str,
        song: &Song,
        writer: TrackWriter,
        started: oneshot::Sender<Result<Start>>,
    ) {
        let (media, frames) = match self.open(key, song).await {
            Ok(Opened::Cached(track)) => {
                let _ = started.send(Ok(Start::Cached(track)));
                return;
            }
            Ok(Opened::Live(media, frames)) => (media, frames),
            Err(error) => {
                let _ = started.send(Err(error));
                return;
            }
        };

        let _ = started.send(Ok(Start::Live));
        self.pump(media, frames, writer).await;
    }

    async fn open(&self, key: &str, song: &Song) -> Result<Opened> {
        let (media, from_cache) = match self.metadata.get(key) {
            Some(media) => (media, true),
            None => (self.lookup_media(key, song).await?, false),
        };

        if let Some(track) = self.audio.get(&media.id) {
            return Ok(Opened::Cached(track));
        }

        info!(song = %song.title, media = %media.id, "fetching audio");
        match self.fetcher.fetch(&media).await {
            Ok(frames) => Ok(Opened::Live(media, frames)),
            // Stream URLs expire, so a cached one gets a single fresh lookup.
            Err(error) if from_cache => {
                warn!(song = %song.title, error = %error, "cached media rejected, resolving again");
                self.metadata.remove(key);

                let media = self.lookup_media(key, song).await?;
                let frames = self.fetcher.fetch(&media).await?;
                Ok(Opened::Live(media, frames))
            }
            Err(error) => Err(error),
        }
    }

    async fn lookup_media(&self, key: &str, song: &Song) -> Result<MediaInfo> {
        let media = self.fetcher.resolve_media(song).await?;
        store(&self.metadata, key.to_string(), media.clone());
        Ok(media)
    }

    /// Copies the transcode into the buffer and caches the song if it was kept whole.
    async fn pump(&self, media: MediaInfo, mut frames: FrameStream, mut writer: TrackWriter) {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    if !writer.push(frame).await {
                        debug!(media = %media.id, "nobody listening, transcode abandoned");
                        return;
                    }
                }
                Err(error) => {
                    warn!(media = %media.id, error = %error, "audio source failed mid-song");
                    writer.fail(error);
                    return;
                }
            }
        }

        match writer.finish() {
            Some(track) => store(&self.audio, media.id, track),
            None => debug!(media = %media.id, "song too large to cache"),
        }
    }
}

fn store<V: Weighted + Clone>(cache: &Cache<V>, key: String, value: V) {
    if let Err(err) = cache.insert(key, value) {
        debug!(cache = cache.name(), error = %err, "entry not cached");
    }
}

/// Canonical cache key for a song URL or search text.
pub fn normalize_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);

    let Some((scheme, rest)) = without_fragment.split_once("://") else {
        return without_fragment
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
    };

    let (authority, path_and_query) = match rest.find(|c| c == '/' || c == '?') {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut key = format!("{}://{}{}", scheme.to_lowercase(), authority.to_lowercase(), path);

    if let Some(query) = query {
        let kept: Vec<&str> = query
            .split('&')
            .filter(|param| !param.is_empty())
            .filter(|param| {
                let name = param.split('=').next().unwrap_or(param);
                !IGNORED_QUERY_PARAMS.contains(&name)
            })
            .collect();

        if !kept.is_empty() {
            key.push('?');
            key.push_str(&kept.join("&"));
        }
    }

    key
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::future::join_all;

    use super::*;
    use crate::metrics::{Counter, Metrics};
    use crate::testing::FakeFetcher;

    fn pipeline(fetcher: Arc<FakeFetcher>) -> (Arc<AudioPipeline>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let pipeline = AudioPipeline::new(fetcher, &EngineConfig::default(), metrics.clone());
        (Arc::new(pipeline), metrics)
    }

    #[test]
    fn normalizes_urls_and_queries() {
        assert_eq!(
            normalize_key("  HTTPS://WWW.YouTube.com/watch?v=AbC&list=PL1&si=xyz#t=3 "),
            "https://www.youtube.com/watch?v=AbC"
        );
        assert_eq!(normalize_key("https://youtu.be/AbC?si=1"), "https://youtu.be/AbC");
        assert_eq!(normalize_key("https://youtu.be"), "https://youtu.be");
        assert_eq!(normalize_key("  Never   Gonna Give "), "never gonna give");
    }

    async fn drain(source: AudioSource) -> Result<Vec<Bytes>> {
        source.into_frames().collect::<Vec<_>>().await.into_iter().collect()
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_fetch() {
        let fetcher = Arc::new(FakeFetcher::new(4).with_delay(Duration::from_millis(50)));
        let (pipeline, _) = pipeline(fetcher.clone());
        let song = Song::new("A", "https://youtu.be/a");

        let results = join_all((0..8).map(|_| pipeline.resolve(&song))).await;

        assert_eq!(fetcher.resolve_calls(), 1);
        assert_eq!(fetcher.fetch_calls(), 1);

        let expected: Vec<Bytes> = (0..4)
            .map(|index| Bytes::from(format!("media:https://youtu.be/a#{index}")))
            .collect();
        let heard = join_all(results.into_iter().map(|result| drain(result.unwrap()))).await;
        for frames in heard {
            assert_eq!(frames.unwrap(), expected);
        }
        assert_eq!(pipeline.audio_cache().stats().entries, 1);
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_error_and_cache_nothing() {
        let fetcher = Arc::new(FakeFetcher::new(4).with_delay(Duration::from_millis(50)));
        fetcher.fail_song("https://youtu.be/broken");
        let (pipeline, _) = pipeline(fetcher.clone());
        let song = Song::new("Broken", "https://youtu.be/broken");

        let results = join_all((0..5).map(|_| pipeline.resolve(&song))).await;

        assert_eq!(fetcher.resolve_calls(), 1);
        for result in &results {
            assert!(matches!(result, Err(Error::LookupFailed(_))));
        }
        assert_eq!(pipeline.metadata_cache().stats().entries, 0);
        assert_eq!(pipeline.audio_cache().stats().entries, 0);

        // Nothing negative was cached, so the next attempt fetches again.
        assert!(pipeline.resolve(&song).await.is_err());
        assert_eq!(fetcher.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn repeated_resolves_hit_both_caches() {
        let fetcher = Arc::new(FakeFetcher::new(3));
        let (pipeline, metrics) = pipeline(fetcher.clone());
        let song = Song::new("A", "https://youtu.be/a?si=share");

        let first = drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();
        let second = pipeline
            .resolve(&Song::new("A again", "https://YOUTU.BE/a"))
            .await
            .unwrap();

        assert!(matches!(second, AudioSource::Cached(_)));
        assert_eq!(drain(second).await.unwrap(), first);
        assert_eq!(fetcher.fetch_calls(), 1);
        assert_eq!(metrics.get(Counter::CacheMiss(METADATA_CACHE)), 1);
        assert_eq!(metrics.get(Counter::CacheHit(METADATA_CACHE)), 1);
        assert_eq!(metrics.get(Counter::CacheMiss(AUDIO_CACHE)), 1);
        assert_eq!(metrics.get(Counter::CacheHit(AUDIO_CACHE)), 1);
    }

    #[tokio::test]
    async fn abandoned_resolve_still_fills_the_cache() {
        let fetcher = Arc::new(FakeFetcher::new(2).with_delay(Duration::from_millis(30)));
        let (pipeline, _) = pipeline(fetcher.clone());
        let song = Song::new("A", "https://youtu.be/a");

        let abandoned = tokio::time::timeout(Duration::from_millis(5), pipeline.resolve(&song)).await;
        assert!(abandoned.is_err());

        drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();
        assert_eq!(fetcher.fetch_calls(), 1);
        assert_eq!(pipeline.audio_cache().stats().entries, 1);
    }

    #[tokio::test]
    async fn expired_stream_url_is_resolved_again() {
        let fetcher = Arc::new(FakeFetcher::new(3));
        let (pipeline, _) = pipeline(fetcher.clone());
        let song = Song::new("A", "https://youtu.be/a");

        drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();
        assert!(pipeline.audio_cache().remove("media:https://youtu.be/a").is_some());
        fetcher.expire_media();

        let frames = drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(fetcher.resolve_calls(), 2);
        assert_eq!(fetcher.fetch_calls(), 3);

        // The refreshed URL was cached, so later misses do not resolve again.
        pipeline.audio_cache().remove("media:https://youtu.be/a");
        drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();
        assert_eq!(fetcher.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn fresh_media_failures_are_not_retried() {
        let fetcher = Arc::new(FakeFetcher::new(3));
        let (pipeline, _) = pipeline(fetcher.clone());
        fetcher.reject_streams();

        let result = pipeline.resolve(&Song::new("A", "https://youtu.be/a")).await;

        assert!(matches!(result, Err(Error::TranscodeFailed(_))));
        assert_eq!((fetcher.resolve_calls(), fetcher.fetch_calls()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn songs_play_while_they_are_still_transcoding() {
        let fetcher = Arc::new(FakeFetcher::new(10).with_frame_delay(Duration::from_millis(100)));
        let (pipeline, _) = pipeline(fetcher.clone());

        let source = pipeline.resolve(&Song::new("A", "https://youtu.be/a")).await.unwrap();
        let mut frames = source.into_frames();

        let start = tokio::time::Instant::now();
        frames.next().await.unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(pipeline.audio_cache().stats().entries, 0);

        while frames.next().await.is_some() {}
        assert_eq!(pipeline.audio_cache().stats().entries, 1);
    }

    #[tokio::test]
    async fn mid_song_failures_reach_the_listener_and_cache_nothing() {
        let fetcher = Arc::new(FakeFetcher::new(5));
        fetcher.break_stream("https://youtu.be/a", 2);
        let (pipeline, _) = pipeline(fetcher.clone());

        let items: Vec<_> = pipeline
            .resolve(&Song::new("A", "https://youtu.be/a"))
            .await
            .unwrap()
            .into_frames()
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(items[..2].iter().all(Result::is_ok));
        assert!(matches!(items[2], Err(Error::TranscodeFailed(_))));
        assert_eq!(pipeline.audio_cache().stats().entries, 0);
    }

    #[tokio::test]
    async fn songs_too_large_to_cache_still_play() {
        let fetcher = Arc::new(FakeFetcher::new(50));
        let metrics = Arc::new(Metrics::new());
        let config = EngineConfig {
            audio_cache_capacity: 64,
            ..EngineConfig::default()
        };
        let pipeline = Arc::new(AudioPipeline::new(fetcher.clone(), &config, metrics));
        let song = Song::new("Long mix", "https://youtu.be/mix");

        let frames = drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();

        assert_eq!(frames.len(), 50);
        assert_eq!(pipeline.audio_cache().stats().entries, 0);

        // Nothing was kept, so the next request transcodes again.
        drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();
        assert_eq!(fetcher.fetch_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_listeners_of_a_trimmed_song_start_a_new_transcode() {
        let fetcher = Arc::new(FakeFetcher::new(10).with_frame_delay(Duration::from_millis(100)));
        let config = EngineConfig {
            audio_cache_capacity: 64,
            ..EngineConfig::default()
        };
        let pipeline = Arc::new(AudioPipeline::new(fetcher.clone(), &config, Arc::new(Metrics::new())));
        let song = Song::new("Long mix", "https://youtu.be/mix");

        let mut first = pipeline.resolve(&song).await.unwrap().into_frames();
        for _ in 0..3 {
            first.next().await.unwrap().unwrap();
        }

        let late = drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();

        assert_eq!(fetcher.fetch_calls(), 2);
        assert_eq!(late.len(), 10);
        assert_eq!(late[0], Bytes::from("media:https://youtu.be/mix#0"));
    }

    #[tokio::test]
    async fn panicking_fetch_does_not_wedge_the_key() {
        let fetcher = Arc::new(FakeFetcher::new(3));
        fetcher.panic_on_next_fetch();
        let (pipeline, _) = pipeline(fetcher.clone());
        let song = Song::new("A", "https://youtu.be/a");

        assert!(matches!(pipeline.resolve(&song).await, Err(Error::TranscodeFailed(_))));

        let frames = drain(pipeline.resolve(&song).await.unwrap()).await.unwrap();
        assert_eq!(frames.len(), 3);
    }
}
