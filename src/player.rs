//! Per-tenant playback: one actor task owns the queue and the state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::error::{Error, Result};
use crate::models::{ChannelRef, PlayerState, PlaylistSnapshot, Song, TenantId};
use crate::source::AudioPipeline;
use crate::streamer::{FrameStreamer, StreamOutcome};
use crate::traits::{Notifier, PlaybackEvent, PlaylistStore, VoiceSession, VoiceTransport};

/// Collaborators shared by every player.
#[derive(Clone)]
pub struct PlayerDeps {
    pub pipeline: Arc<AudioPipeline>,
    pub streamer: FrameStreamer,
    pub transport: Arc<dyn VoiceTransport>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn PlaylistStore>,
}

enum Command {
    Add {
        text: ChannelRef,
        voice: ChannelRef,
        song: Song,
        reply: oneshot::Sender<Result<()>>,
    },
    Skip {
        reply: oneshot::Sender<()>,
    },
    Remove {
        position: usize,
        reply: oneshot::Sender<Result<Song>>,
    },
    Playlist {
        reply: oneshot::Sender<Vec<Song>>,
    },
    NowPlaying {
        reply: oneshot::Sender<Option<Song>>,
    },
    State {
        reply: oneshot::Sender<PlayerState>,
    },
    VoiceChannel {
        reply: oneshot::Sender<Option<ChannelRef>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum PlaybackReport {
    Started {
        generation: u64,
    },
    Finished {
        generation: u64,
        result: Result<StreamOutcome>,
    },
}

/// Cheap, cloneable access to a tenant's player.
#[derive(Clone)]
pub struct PlayerHandle {
    tenant: TenantId,
    commands: mpsc::UnboundedSender<Command>,
}

impl PlayerHandle {
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// True once the player has been stopped or shut down.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::PlayerClosed)?;
        response.await.map_err(|_| Error::PlayerClosed)
    }

    /// Queues `song`, opening a voice session on `voice` if none is open.
    pub async fn add_song(&self, text: ChannelRef, voice: ChannelRef, song: Song) -> Result<()> {
        self.request(|reply| Command::Add {
            text,
            voice,
            song,
            reply,
        })
        .await?
    }

    pub async fn skip_song(&self) -> Result<()> {
        self.request(|reply| Command::Skip { reply }).await
    }

    /// Removes the pending song at 1-based `position`.
    pub async fn remove_song(&self, position: usize) -> Result<Song> {
        self.request(|reply| Command::Remove { position, reply })
            .await?
    }

    /// Pending songs, without the one currently playing.
    pub async fn get_playlist(&self) -> Result<Vec<Song>> {
        self.request(|reply| Command::Playlist { reply }).await
    }

    pub async fn get_played_song(&self) -> Result<Option<Song>> {
        self.request(|reply| Command::NowPlaying { reply }).await
    }

    pub async fn state(&self) -> PlayerState {
        self.request(|reply| Command::State { reply })
            .await
            .unwrap_or(PlayerState::Closed)
    }

    pub async fn voice_channel(&self) -> Result<Option<ChannelRef>> {
        self.request(|reply| Command::VoiceChannel { reply }).await
    }

    /// Stops playback, clears the queue and leaves the voice channel.
    ///
    /// Stopping an already closed player does nothing.
    pub async fn stop(&self) {
        if let Err(err) = self.request(|reply| Command::Stop { reply }).await {
            debug!(tenant = %self.tenant, error = %err, "stop on a closed player");
        }
    }

    /// Closes the player like `stop` but leaves the stored playlist intact.
    pub async fn shutdown(&self) {
        if let Err(err) = self.request(|reply| Command::Shutdown { reply }).await {
            debug!(tenant = %self.tenant, error = %err, "shutdown on a closed player");
        }
    }
}

struct Playback {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct PlayerActor {
    tenant: TenantId,
    deps: PlayerDeps,
    state: PlayerState,
    queue: VecDeque<Song>,
    now_playing: Option<Arc<Song>>,
    session: Option<Arc<dyn VoiceSession>>,
    /// Where the session lives, kept so a failed session can be reopened.
    voice_channel: Option<ChannelRef>,
    text_channel: Option<ChannelRef>,
    root: CancellationToken,
    current: Option<Playback>,
    generation: u64,
    reports: mpsc::UnboundedSender<PlaybackReport>,
}

pub fn spawn_player(tenant: TenantId, deps: PlayerDeps) -> PlayerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();

    let actor = PlayerActor {
        tenant,
        deps,
        state: PlayerState::Idle,
        queue: VecDeque::new(),
        now_playing: None,
        session: None,
        voice_channel: None,
        text_channel: None,
        root: CancellationToken::new(),
        current: None,
        generation: 0,
        reports: reports_tx,
    };

    tokio::spawn(
        actor
            .run(commands_rx, reports_rx)
            .instrument(info_span!("player", tenant = %tenant)),
    );

    PlayerHandle {
        tenant,
        commands: commands_tx,
    }
}

impl PlayerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<PlaybackReport>,
    ) {
        self.restore().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        commands.close();
                        self.close(true).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(Command::Shutdown { reply }) => {
                        commands.close();
                        self.close(false).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.close(false).await;
                        break;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report).await,
            }
        }

        info!("player closed");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Add {
                text,
                voice,
                song,
                reply,
            } => {
                let result = self.add_song(text, voice, song).await;
                let _ = reply.send(result);
            }
            Command::Skip { reply } => {
                self.skip().await;
                let _ = reply.send(());
            }
            Command::Remove { position, reply } => {
                let result = self.remove_song(position).await;
                let _ = reply.send(result);
            }
            Command::Playlist { reply } => {
                let _ = reply.send(self.queue.iter().cloned().collect());
            }
            Command::NowPlaying { reply } => {
                let _ = reply.send(self.now_playing.as_deref().cloned());
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
            Command::VoiceChannel { reply } => {
                let _ = reply.send(self.session.as_ref().map(|session| session.channel()));
            }
            // Handled by the run loop, which owns the receiver.
            Command::Stop { .. } | Command::Shutdown { .. } => {}
        }
    }

    async fn add_song(&mut self, text: ChannelRef, voice: ChannelRef, song: Song) -> Result<()> {
        self.ensure_session(voice).await?;
        self.text_channel = Some(text);

        info!(song = %song.title, position = self.queue.len() + 1, "song queued");
        self.queue.push_back(song);

        self.play_next().await;
        self.persist().await;
        Ok(())
    }

    async fn remove_song(&mut self, position: usize) -> Result<Song> {
        let len = self.queue.len();
        if position < 1 || position > len {
            return Err(Error::InvalidPosition { position, len });
        }

        let song = self
            .queue
            .remove(position - 1)
            .ok_or(Error::InvalidPosition { position, len })?;

        info!(song = %song.title, position, "song removed");
        self.persist().await;
        Ok(song)
    }

    async fn skip(&mut self) {
        let Some(playback) = self.current.take() else {
            debug!("skip while idle");
            return;
        };

        playback.token.cancel();
        if let Err(err) = playback.task.await {
            warn!(error = %err, "playback task ended abnormally");
        }

        if let Some(song) = self.now_playing.take() {
            info!(song = %song.title, "song skipped");
        }
        self.state = PlayerState::Idle;

        self.play_next().await;
        self.persist().await;
    }

    async fn ensure_session(&mut self, voice: ChannelRef) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let session = self.deps.transport.open(self.tenant, voice).await?;
        info!(channel = %voice, "voice session opened");
        self.session = Some(session);
        self.voice_channel = Some(voice);
        Ok(())
    }

    /// Closes a session whose transport failed. The next song opens a new one.
    async fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            info!(channel = %session.channel(), "voice session discarded");
        }
    }

    /// Starts the head of the queue if nothing is playing.
    ///
    /// Reopens the voice session first when a previous one was discarded. If
    /// that fails the queue stays pending until the next song is added.
    async fn play_next(&mut self) {
        if self.state != PlayerState::Idle || self.current.is_some() || self.queue.is_empty() {
            return;
        }

        if self.session.is_none() {
            let Some(voice) = self.voice_channel else {
                return;
            };
            if let Err(err) = self.ensure_session(voice).await {
                warn!(error = %err, "could not open voice session");
                return;
            }
        }

        let Some(session) = self.session.clone() else {
            return;
        };
        let Some(song) = self.queue.pop_front() else {
            return;
        };

        let song = Arc::new(song);
        self.generation += 1;
        let generation = self.generation;
        let token = self.root.child_token();

        debug!(song = %song.title, generation, "loading song");
        self.state = PlayerState::Loading;
        self.now_playing = Some(song.clone());

        let playback = SongPlayback {
            generation,
            song,
            session,
            text_channel: self.text_channel,
            token: token.clone(),
            deps: self.deps.clone(),
            reports: self.reports.clone(),
        };

        self.current = Some(Playback {
            generation,
            token,
            task: tokio::spawn(playback.run().in_current_span()),
        });
    }

    async fn handle_report(&mut self, report: PlaybackReport) {
        let current = self.current.as_ref().map(|playback| playback.generation);

        match report {
            PlaybackReport::Started { generation } if current == Some(generation) => {
                self.state = PlayerState::Playing;
            }
            PlaybackReport::Finished { generation, result } if current == Some(generation) => {
                self.current = None;
                let song = self.now_playing.take();
                let title = song.as_ref().map(|song| song.title.as_str()).unwrap_or_default();

                match result {
                    Ok(StreamOutcome::Completed { frames }) => {
                        info!(song = title, frames, "song finished")
                    }
                    Ok(StreamOutcome::Cancelled { frames }) => {
                        debug!(song = title, frames, "song cancelled")
                    }
                    Ok(StreamOutcome::TransportFailed { frames, error }) => {
                        warn!(song = title, frames, error = %error, "song aborted by the voice transport");
                        self.discard_session().await;
                    }
                    Ok(StreamOutcome::SourceFailed { frames, error }) => {
                        warn!(song = title, frames, error = %error, "song aborted by its source")
                    }
                    Err(error) => warn!(song = title, error = %error, "song could not be loaded"),
                }

                self.state = PlayerState::Idle;
                self.play_next().await;
                self.persist().await;
            }
            _ => debug!("stale playback report ignored"),
        }
    }

    /// Loads the stored playlist and resumes it when the voice channel is known.
    async fn restore(&mut self) {
        let snapshot = match self.deps.store.load(self.tenant).await {
            Ok(Some(snapshot)) if !snapshot.songs.is_empty() => snapshot,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "could not load stored playlist");
                return;
            }
        };

        info!(songs = snapshot.songs.len(), "restoring stored playlist");
        self.queue.extend(snapshot.songs);
        self.text_channel = snapshot.text_channel;
        self.voice_channel = snapshot.voice_channel;

        self.play_next().await;
    }

    /// Writes the current song and the pending queue to the store.
    async fn persist(&self) {
        let snapshot = PlaylistSnapshot {
            text_channel: self.text_channel,
            voice_channel: self.voice_channel,
            songs: self
                .now_playing
                .as_deref()
                .into_iter()
                .chain(self.queue.iter())
                .cloned()
                .collect(),
        };

        if let Err(err) = self.deps.store.save(self.tenant, &snapshot).await {
            warn!(error = %err, "could not store playlist");
        }
    }

    async fn close(&mut self, clear: bool) {
        self.root.cancel();
        if let Some(playback) = self.current.take() {
            if let Err(err) = playback.task.await {
                warn!(error = %err, "playback task ended abnormally");
            }
        }

        if clear {
            self.now_playing = None;
            self.queue.clear();
            self.persist().await;
        }

        if let Some(session) = self.session.take() {
            session.close().await;
            info!(channel = %session.channel(), "voice session closed");
        }

        self.now_playing = None;
        self.state = PlayerState::Closed;
    }
}

/// Everything one song's playback task needs.
struct SongPlayback {
    generation: u64,
    song: Arc<Song>,
    session: Arc<dyn VoiceSession>,
    text_channel: Option<ChannelRef>,
    token: CancellationToken,
    deps: PlayerDeps,
    reports: mpsc::UnboundedSender<PlaybackReport>,
}

impl SongPlayback {
    async fn run(self) {
        let resolved = tokio::select! {
            biased;
            _ = self.token.cancelled() => Ok(None),
            resolved = self.deps.pipeline.resolve(&self.song) => resolved.map(Some),
        };

        let result = match resolved {
            Ok(Some(source)) => {
                let _ = self.reports.send(PlaybackReport::Started {
                    generation: self.generation,
                });
                self.notify(PlaybackEvent::NowPlaying(Song::clone(&self.song)));

                let outcome = self
                    .deps
                    .streamer
                    .stream(source.into_frames(), self.session.as_ref(), &self.token)
                    .await;

                if let StreamOutcome::TransportFailed { error, .. }
                | StreamOutcome::SourceFailed { error, .. } = &outcome
                {
                    self.notify_failure(error);
                }
                Ok(outcome)
            }
            Ok(None) => Ok(StreamOutcome::Cancelled { frames: 0 }),
            Err(error) => {
                self.notify_failure(&error);
                Err(error)
            }
        };

        let _ = self.reports.send(PlaybackReport::Finished {
            generation: self.generation,
            result,
        });
    }

    fn notify_failure(&self, error: &Error) {
        self.notify(PlaybackEvent::SongFailed {
            song: Song::clone(&self.song),
            reason: error.to_string(),
        });
    }

    /// Messages are sent on their own task so a slow chat API never delays a skip.
    fn notify(&self, event: PlaybackEvent) {
        let Some(channel) = self.text_channel else {
            return;
        };
        let notifier = Arc::clone(&self.deps.notifier);
        tokio::spawn(async move { notifier.notify(channel, event).await });
    }
}
