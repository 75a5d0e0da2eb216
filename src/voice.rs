use std::sync::Arc;

use parking_lot::Mutex;
use serenity::async_trait;
use serenity::model::id::GuildId;
use songbird::input::Input;
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::PlaybackError;

pub type PlaybackOutcome = Result<(), PlaybackError>;

/// Fires at most once, whatever ends the track first.
pub struct CompletionSignal {
    sender: Mutex<Option<oneshot::Sender<PlaybackOutcome>>>,
}

impl CompletionSignal {
    pub fn fire(&self, outcome: PlaybackOutcome) {
        if let Some(sender) = self.sender.lock().take() {
            // The session may already be gone.
            let _ = sender.send(outcome);
        }
    }
}

pub fn completion() -> (CompletionSignal, oneshot::Receiver<PlaybackOutcome>) {
    let (sender, receiver) = oneshot::channel();

    (CompletionSignal { sender: Mutex::new(Some(sender)) }, receiver)
}

/// A guild's audio output.
///
/// `play` hands over a [`CompletionSignal`] that must fire once the track
/// ends, is stopped or fails. The playback loop does not advance before that.
#[async_trait]
pub trait AudioConnection: Send + Sync {
    type Source: Send;

    async fn play(&self, source: Self::Source, volume: f32, on_finished: CompletionSignal) -> Result<(), PlaybackError>;

    async fn stop(&self) -> Result<(), PlaybackError>;

    async fn pause(&self) -> Result<(), PlaybackError>;

    async fn resume(&self) -> Result<(), PlaybackError>;

    async fn is_playing(&self) -> bool;

    async fn is_paused(&self) -> bool;

    async fn set_volume(&self, volume: f32) -> Result<(), PlaybackError>;

    async fn disconnect(&self);
}

pub struct SongbirdConnection {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    track_handle: Mutex<Option<TrackHandle>>,
}

impl SongbirdConnection {
    pub fn new(manager: Arc<Songbird>, guild_id: GuildId) -> Self {
        SongbirdConnection {
            manager,
            guild_id,
            track_handle: Mutex::new(None),
        }
    }

    fn track_handle(&self) -> Option<TrackHandle> {
        self.track_handle.lock().clone()
    }

    async fn play_mode(&self) -> Option<PlayMode> {
        let track_handle = self.track_handle()?;
        let state = track_handle.get_info().await.ok()?;

        Some(state.playing)
    }
}

#[async_trait]
impl AudioConnection for SongbirdConnection {
    type Source = Input;

    async fn play(&self, source: Input, volume: f32, on_finished: CompletionSignal) -> Result<(), PlaybackError> {
        let handler_lock = self.manager.get(self.guild_id).ok_or(PlaybackError::NotConnected)?;

        let track_handle = {
            let mut handler = handler_lock.lock().await;

            handler.stop(); // Just in case something was playing before
            handler.play_source(source)
        };

        prepare_track(&track_handle, volume, Event::Track(TrackEvent::End), on_finished)?;

        *self.track_handle.lock() = Some(track_handle);

        Ok(())
    }

    async fn stop(&self) -> Result<(), PlaybackError> {
        if let Some(track_handle) = self.track_handle.lock().take() {
            track_handle.stop()?;
        }

        Ok(())
    }

    async fn pause(&self) -> Result<(), PlaybackError> {
        match self.track_handle() {
            Some(track_handle) => Ok(track_handle.pause()?),
            None => Err(PlaybackError::NotConnected),
        }
    }

    async fn resume(&self) -> Result<(), PlaybackError> {
        match self.track_handle() {
            Some(track_handle) => Ok(track_handle.play()?),
            None => Err(PlaybackError::NotConnected),
        }
    }

    async fn is_playing(&self) -> bool {
        self.play_mode().await == Some(PlayMode::Play)
    }

    async fn is_paused(&self) -> bool {
        self.play_mode().await == Some(PlayMode::Pause)
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlaybackError> {
        if let Some(track_handle) = self.track_handle() {
            track_handle.set_volume(volume)?;
        }

        Ok(())
    }

    async fn disconnect(&self) {
        self.track_handle.lock().take();

        if self.manager.get(self.guild_id).is_some() {
            if let Err(why) = self.manager.remove(self.guild_id).await {
                warn!("Failed to leave voice in guild {}: {why:?}", self.guild_id.0);
            }
        }
    }
}

/// Sets the volume and hooks `on_finished` to `end_event`. A track that cannot
/// be set up is stopped, since nothing else would ever reach it.
fn prepare_track(track_handle: &TrackHandle, volume: f32, end_event: Event, on_finished: CompletionSignal) -> Result<(), PlaybackError> {
    let prepared = track_handle
        .set_volume(volume)
        .and_then(|_| track_handle.add_event(end_event, SongEndNotifier { on_finished }));

    if let Err(why) = prepared {
        if let Err(stop_error) = track_handle.stop() {
            warn!("Could not stop a track that failed to start: {stop_error:?}");
        }

        return Err(why.into());
    }

    Ok(())
}

struct SongEndNotifier {
    on_finished: CompletionSignal,
}

#[async_trait]
impl VoiceEventHandler for SongEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        info!("End notifier triggered");

        self.on_finished.fire(Ok(()));

        None
    }
}
