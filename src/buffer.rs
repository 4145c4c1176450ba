//! Fan-out buffer between one live transcode and the songs playing it.
//!
//! The writer runs at most `readahead` frames ahead of the slowest reader.
//! While the song still fits the retention limit every frame is kept, so a
//! finished song can be cached whole and late readers can start from the
//! beginning. Past the limit, frames every reader has passed are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::AudioTrack;
use crate::traits::FrameStream;

struct BufferState {
    frames: VecDeque<Bytes>,
    /// Song index of `frames[0]`.
    offset: usize,
    bytes: usize,
    retaining: bool,
    end: Option<Result<()>>,
    /// Next song index each reader will take.
    readers: HashMap<u64, usize>,
    next_reader: u64,
}

impl BufferState {
    fn produced(&self) -> usize {
        self.offset + self.frames.len()
    }

    fn slowest_reader(&self) -> Option<usize> {
        self.readers.values().copied().min()
    }

    fn trim(&mut self) {
        if self.retaining {
            return;
        }

        let floor = self.slowest_reader().unwrap_or_else(|| self.produced());
        while self.offset < floor && self.frames.pop_front().is_some() {
            self.offset += 1;
        }
    }
}

struct Shared {
    state: Mutex<BufferState>,
    notify: Notify,
    retain_limit: usize,
    readahead: usize,
}

impl Shared {
    fn end(&self, result: Result<()>) {
        {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return;
            }
            state.end = Some(result);
        }
        self.notify.notify_waiters();
    }
}

#[derive(Clone)]
pub struct TrackBuffer {
    shared: Arc<Shared>,
}

pub struct TrackWriter {
    shared: Arc<Shared>,
}

pub struct TrackReader {
    shared: Arc<Shared>,
    id: u64,
    done: bool,
}

impl TrackBuffer {
    /// Creates a buffer keeping up to `retain_limit` bytes of the song whole.
    pub fn new(retain_limit: usize, readahead: usize) -> (TrackBuffer, TrackWriter) {
        let shared = Arc::new(Shared {
            state: Mutex::new(BufferState {
                frames: VecDeque::new(),
                offset: 0,
                bytes: 0,
                retaining: true,
                end: None,
                readers: HashMap::new(),
                next_reader: 0,
            }),
            notify: Notify::new(),
            retain_limit,
            readahead: readahead.max(1),
        });

        (
            TrackBuffer {
                shared: shared.clone(),
            },
            TrackWriter { shared },
        )
    }

    /// A reader starting at the first frame, or `None` once that frame is gone.
    pub fn reader(&self) -> Option<TrackReader> {
        let mut state = self.shared.state.lock();
        if state.offset > 0 {
            return None;
        }

        let id = state.next_reader;
        state.next_reader += 1;
        state.readers.insert(id, 0);

        Some(TrackReader {
            shared: self.shared.clone(),
            id,
            done: false,
        })
    }
}

impl TrackWriter {
    /// Appends `frame`, waiting while the slowest reader is `readahead` frames behind.
    ///
    /// Returns false when no reader is left and the song is too large to keep,
    /// so nothing will ever use the rest of it.
    pub async fn push(&mut self, frame: Bytes) -> bool {
        loop {
            let notified = self.shared.notify.notified();

            {
                let mut state = self.shared.state.lock();
                let room = match state.slowest_reader() {
                    Some(cursor) => state.produced() - cursor < self.shared.readahead,
                    None if state.retaining => true,
                    None => return false,
                };

                if room {
                    state.bytes += frame.len();
                    state.frames.push_back(frame);

                    if state.retaining && state.bytes > self.shared.retain_limit {
                        debug!(bytes = state.bytes, "song exceeds the retention limit");
                        state.retaining = false;
                    }
                    state.trim();
                    drop(state);

                    self.shared.notify.notify_waiters();
                    return true;
                }
            }

            notified.await;
        }
    }

    /// Ends the song. Returns it whole when every frame was kept.
    pub fn finish(self) -> Option<AudioTrack> {
        let track = {
            let state = self.shared.state.lock();
            state
                .retaining
                .then(|| AudioTrack::new(state.frames.iter().cloned().collect()))
        };

        self.shared.end(Ok(()));
        track
    }

    pub fn fail(self, error: Error) {
        self.shared.end(Err(error));
    }
}

impl Drop for TrackWriter {
    fn drop(&mut self) {
        self.shared.end(Err(Error::TranscodeFailed(
            "audio source stopped before the end of the song".to_string(),
        )));
    }
}

impl TrackReader {
    /// Next frame, waiting for the writer when caught up. `None` after the end.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }

        loop {
            let notified = self.shared.notify.notified();

            {
                let mut state = self.shared.state.lock();
                let cursor = state.readers.get(&self.id).copied()?;

                if cursor < state.produced() {
                    let frame = state.frames[cursor - state.offset].clone();
                    state.readers.insert(self.id, cursor + 1);
                    state.trim();
                    drop(state);

                    self.shared.notify.notify_waiters();
                    return Some(Ok(frame));
                }

                match &state.end {
                    Some(Ok(())) => {
                        self.done = true;
                        return None;
                    }
                    Some(Err(error)) => {
                        self.done = true;
                        return Some(Err(error.clone()));
                    }
                    None => {}
                }
            }

            notified.await;
        }
    }

    pub fn into_stream(self) -> FrameStream {
        stream::unfold(self, |mut reader| async move {
            let item = reader.next_frame().await?;
            Some((item, reader))
        })
        .boxed()
    }
}

impl Drop for TrackReader {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.readers.remove(&self.id);
            state.trim();
        }
        self.shared.notify.notify_waiters();
    }
}
