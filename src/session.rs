//! The per-guild player: a queue of pending tracks and the background loop
//! that plays them one at a time.
//!
//! The loop waits (at most `idle_timeout`) for the queue to become non-empty,
//! moves the head into `current`, fetches a fresh stream for it, hands that to
//! the [`AudioConnection`] and then waits for the connection's completion
//! signal. Skipping is just stopping the stream, so the loop settings are
//! applied the same way whether a track ends, is skipped or fails.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::thread_rng;
use serenity::model::id::GuildId;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chat::ChatChannel;
use crate::error::MusicError;
use crate::models::TrackInfo;
use crate::resolver::SourceResolver;
use crate::voice::{completion, AudioConnection};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_VOLUME: f32 = 0.5;

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub default_volume: f32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            default_volume: DEFAULT_VOLUME,
        }
    }
}

/// The collaborators a session talks to.
pub struct SessionParts<S> {
    pub resolver: Arc<dyn SourceResolver<Source = S>>,
    pub connection: Arc<dyn AudioConnection<Source = S>>,
    pub channel: Arc<dyn ChatChannel>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    IdleTimeout,
    Disconnected,
}

#[derive(Clone, Debug)]
pub struct NowPlaying {
    pub track: Option<Arc<TrackInfo>>,
    pub loop_song: bool,
    pub loop_queue: bool,
    pub volume: f32,
}

struct PlayerState {
    queue: VecDeque<Arc<TrackInfo>>,
    current: Option<Arc<TrackInfo>>,
    loop_song: bool,
    loop_queue: bool,
    volume: f32,
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct PlaybackSession<S> {
    guild_id: GuildId,
    state: Mutex<PlayerState>,
    pending: Notify,
    shutdown: CancellationToken,
    idle_timeout: Duration,
    resolver: Arc<dyn SourceResolver<Source = S>>,
    connection: Arc<dyn AudioConnection<Source = S>>,
    channel: Arc<dyn ChatChannel>,
}

impl<S: Send> PlaybackSession<S> {
    pub fn new(guild_id: GuildId, parts: SessionParts<S>, settings: &SessionSettings) -> Self {
        PlaybackSession {
            guild_id,
            state: Mutex::new(PlayerState {
                queue: VecDeque::new(),
                current: None,
                loop_song: false,
                loop_queue: false,
                volume: settings.default_volume,
            }),
            pending: Notify::new(),
            shutdown: CancellationToken::new(),
            idle_timeout: settings.idle_timeout,
            resolver: parts.resolver,
            connection: parts.connection,
            channel: parts.channel,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Queues `tracks`, keeping their order, at either end of the queue.
    /// Returns how many were added.
    pub fn enqueue(&self, tracks: impl IntoIterator<Item = TrackInfo>, position: Position) -> usize {
        let tracks: Vec<Arc<TrackInfo>> = tracks.into_iter().map(Arc::new).collect();
        let added = tracks.len();

        {
            let mut state = self.state.lock();

            match position {
                Position::Front => tracks.into_iter().rev().for_each(|track| state.queue.push_front(track)),
                Position::Back => state.queue.extend(tracks),
            }
        }

        if added > 0 {
            self.pending.notify_one();
        }

        added
    }

    /// Pops the head of the queue and makes it the current track.
    pub fn dequeue_next(&self) -> Option<Arc<TrackInfo>> {
        let mut state = self.state.lock();
        let track = state.queue.pop_front()?;

        state.current = Some(Arc::clone(&track));

        Some(track)
    }

    /// Retires the current track. When looping, the same track goes back into
    /// the queue and is returned.
    pub fn finish_current(&self) -> Option<Arc<TrackInfo>> {
        let requeued = {
            let mut state = self.state.lock();
            let track = state.current.take()?;

            // Looping the song wins over looping the queue.
            if state.loop_song {
                state.queue.push_front(Arc::clone(&track));
            } else if state.loop_queue {
                state.queue.push_back(Arc::clone(&track));
            }

            (state.loop_song || state.loop_queue).then_some(track)
        };

        if requeued.is_some() {
            self.pending.notify_one();
        }

        requeued
    }

    /// Discards the current track without looping it.
    pub fn drop_current(&self) -> Option<Arc<TrackInfo>> {
        self.state.lock().current.take()
    }

    /// Removes the pending track at `index` (0-based).
    pub fn remove(&self, index: usize) -> Result<Arc<TrackInfo>, MusicError> {
        let mut state = self.state.lock();
        let len = state.queue.len();

        state
            .queue
            .remove(index)
            .ok_or(MusicError::IndexOutOfRange { position: index + 1, len })
    }

    pub fn shuffle(&self) {
        let mut state = self.state.lock();

        state.queue.make_contiguous().shuffle(&mut thread_rng());
    }

    /// Stops the track in flight; the loop then picks the next one as usual.
    /// Returns whether anything was playing.
    pub async fn skip(&self) -> Result<bool, MusicError> {
        if !self.connection.is_playing().await && !self.connection.is_paused().await {
            return Ok(false);
        }

        self.connection.stop().await?;

        Ok(true)
    }

    /// Drops the pending tracks in front of `index` and skips to it.
    pub async fn skip_to(&self, index: usize) -> Result<bool, MusicError> {
        {
            let mut state = self.state.lock();
            let len = state.queue.len();

            if index >= len {
                return Err(MusicError::IndexOutOfRange { position: index + 1, len });
            }

            state.queue.drain(..index);
        }

        self.skip().await
    }

    pub fn peek_page(&self, count: usize, start: usize) -> Vec<Arc<TrackInfo>> {
        let state = self.state.lock();

        state.queue.iter().skip(start).take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn now_playing(&self) -> NowPlaying {
        let state = self.state.lock();

        NowPlaying {
            track: state.current.clone(),
            loop_song: state.loop_song,
            loop_queue: state.loop_queue,
            volume: state.volume,
        }
    }

    pub fn toggle_loop_song(&self) -> bool {
        let mut state = self.state.lock();
        state.loop_song = !state.loop_song;

        state.loop_song
    }

    pub fn toggle_loop_queue(&self) -> bool {
        let mut state = self.state.lock();
        state.loop_queue = !state.loop_queue;

        state.loop_queue
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    /// Sets the volume from a 1-100 percentage, for this track and the next ones.
    pub async fn set_volume(&self, percent: f32) -> Result<(), MusicError> {
        if !(1.0..=100.0).contains(&percent) {
            return Err(MusicError::VolumeOutOfRange(percent));
        }

        let volume = percent / 100.0;
        self.state.lock().volume = volume;

        self.connection.set_volume(volume).await?;

        Ok(())
    }

    /// Returns false when already paused.
    pub async fn pause(&self) -> Result<bool, MusicError> {
        if self.connection.is_paused().await {
            return Ok(false);
        }

        if !self.connection.is_playing().await {
            return Err(MusicError::NotPlaying);
        }

        self.connection.pause().await?;

        Ok(true)
    }

    /// Returns false when not paused.
    pub async fn resume(&self) -> Result<bool, MusicError> {
        if !self.connection.is_paused().await {
            return Ok(false);
        }

        self.connection.resume().await?;

        Ok(true)
    }

    /// Leaves the voice channel. Only for a session that is no longer registered.
    pub async fn leave_voice(&self) {
        self.connection.disconnect().await;
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Plays the queue until the session idles out or is shut down. An idle
    /// timeout leaves the session as it is: whoever owns it decides whether to
    /// tear it down or run it again.
    pub async fn run(&self) -> SessionEnd {
        loop {
            let track = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SessionEnd::Disconnected,
                track = self.wait_for_track() => track,
            };

            let Some(track) = track else {
                info!("Timed out while waiting for next song in queue");

                return SessionEnd::IdleTimeout;
            };

            if let Flow::Shutdown = self.play_track(track).await {
                return SessionEnd::Disconnected;
            }
        }
    }

    async fn wait_for_track(&self) -> Option<Arc<TrackInfo>> {
        let deadline = Instant::now() + self.idle_timeout;

        loop {
            if let Some(track) = self.dequeue_next() {
                return Some(track);
            }

            if timeout_at(deadline, self.pending.notified()).await.is_err() {
                return self.dequeue_next();
            }
        }
    }

    async fn play_track(&self, track: Arc<TrackInfo>) -> Flow {
        info!("Next song is {} - {}, requested by user {}", track.title, track.url, track.requester.id.0);

        let source = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                self.drop_current();
                return Flow::Shutdown;
            }
            source = self.resolver.materialize(&track) => source,
        };

        let source = match source {
            Ok(source) => source,
            Err(why) => {
                error!("Could not play {}: {why:?}", track.title);
                self.channel.send(&error_notice(&why)).await;
                self.drop_current();

                return Flow::Continue;
            }
        };

        let (on_finished, finished) = completion();

        if let Err(why) = self.connection.play(source, self.volume(), on_finished).await {
            error!("Could not start {}: {why:?}", track.title);
            self.channel.send(&error_notice(&why)).await;
            self.drop_current();

            return Flow::Continue;
        }

        self.channel
            .send(&format!("**Now Playing:** `{}` requested by `{}`", track.title, track.requester))
            .await;

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                if let Err(why) = self.connection.stop().await {
                    warn!("Failed to stop {} on shutdown: {why}", track.title);
                }
                self.drop_current();

                return Flow::Shutdown;
            }
            outcome = finished => outcome,
        };

        // A dropped signal means the connection went away without reporting.
        if let Ok(Err(why)) = outcome {
            error!("Playback of {} failed: {why:?}", track.title);
            self.channel.send(&error_notice(&why)).await;
        }

        self.finish_current();

        Flow::Continue
    }
}

fn error_notice(why: &impl Display) -> String {
    format!("Error:\n```css\n[{why}]\n```")
}
