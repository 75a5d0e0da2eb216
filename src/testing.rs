//! In-memory stand-ins for yt-dlp, songbird and the text channel.

use std::collections::HashSet;
use std::future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serenity::async_trait;
use serenity::model::id::UserId;
use tokio::sync::{mpsc, Notify};

use crate::chat::ChatChannel;
use crate::error::{PlaybackError, ResolutionError};
use crate::models::{Requester, TrackInfo};
use crate::resolver::SourceResolver;
use crate::voice::{AudioConnection, CompletionSignal};

pub fn track(title: &str) -> TrackInfo {
    TrackInfo {
        url: format!("https://www.youtube.com/watch?v={title}"),
        title: title.to_string(),
        requester: Requester { id: UserId(99), name: "tester#0099".to_string() },
        duration: None,
    }
}

/// Resolves comma separated titles; the "stream" is just the title.
#[derive(Default)]
pub struct FakeResolver {
    broken: HashSet<String>,
    stalled: HashSet<String>,
}

impl FakeResolver {
    pub fn failing_on(titles: &[&str]) -> Self {
        FakeResolver {
            broken: titles.iter().map(|title| title.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Never finishes fetching a stream for these titles.
    pub fn stalling_on(titles: &[&str]) -> Self {
        FakeResolver {
            stalled: titles.iter().map(|title| title.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SourceResolver for FakeResolver {
    type Source = String;

    async fn search(&self, query: &str, _requester: &Requester) -> Result<Vec<TrackInfo>, ResolutionError> {
        let tracks: Vec<TrackInfo> = query.split(',').map(str::trim).filter(|title| !title.is_empty()).map(track).collect();

        if tracks.is_empty() {
            Err(ResolutionError::NotFound(query.to_string()))
        } else {
            Ok(tracks)
        }
    }

    async fn materialize(&self, track: &TrackInfo) -> Result<String, ResolutionError> {
        if self.stalled.contains(&track.title) {
            future::pending::<()>().await;
        }

        if self.broken.contains(&track.title) {
            return Err(ResolutionError::Stream {
                title: track.title.clone(),
                reason: "video unavailable".to_string(),
            });
        }

        Ok(track.title.clone())
    }
}

/// Plays nothing: tests decide when a track ends.
pub struct FakeConnection {
    started: mpsc::UnboundedSender<String>,
    started_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    in_flight: Mutex<Option<CompletionSignal>>,
    paused: AtomicBool,
    volume: Mutex<Option<f32>>,
    stops: AtomicUsize,
    hold_disconnect: AtomicBool,
    disconnecting: Notify,
    disconnect_released: Notify,
    disconnected: AtomicBool,
}

impl Default for FakeConnection {
    fn default() -> Self {
        let (started, started_rx) = mpsc::unbounded_channel();

        FakeConnection {
            started,
            started_rx: tokio::sync::Mutex::new(started_rx),
            in_flight: Mutex::new(None),
            paused: AtomicBool::new(false),
            volume: Mutex::new(None),
            stops: AtomicUsize::new(0),
            hold_disconnect: AtomicBool::new(false),
            disconnecting: Notify::new(),
            disconnect_released: Notify::new(),
            disconnected: AtomicBool::new(false),
        }
    }
}

impl FakeConnection {
    /// Waits for the next track the session starts.
    pub async fn next_started(&self) -> String {
        self.started_rx.lock().await.recv().await.unwrap_or_default()
    }

    /// The next track the session started, if any, without waiting.
    pub fn try_next_started(&self) -> Option<String> {
        self.started_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Ends the track in flight naturally.
    pub fn finish(&self) {
        self.end(Ok(()));
    }

    pub fn fail(&self, reason: &str) {
        self.end(Err(PlaybackError::Interrupted(reason.to_string())));
    }

    pub fn volume(&self) -> Option<f32> {
        *self.volume.lock()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Makes `disconnect` block until [`FakeConnection::release_disconnect`].
    pub fn hold_disconnect(&self) {
        self.hold_disconnect.store(true, Ordering::SeqCst);
    }

    /// Waits until a session is stuck in `disconnect`.
    pub async fn disconnecting(&self) {
        self.disconnecting.notified().await;
    }

    pub fn release_disconnect(&self) {
        self.disconnect_released.notify_one();
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn end(&self, outcome: Result<(), PlaybackError>) {
        self.paused.store(false, Ordering::SeqCst);

        if let Some(signal) = self.in_flight.lock().take() {
            signal.fire(outcome);
        }
    }
}

#[async_trait]
impl AudioConnection for FakeConnection {
    type Source = String;

    async fn play(&self, source: String, volume: f32, on_finished: CompletionSignal) -> Result<(), PlaybackError> {
        *self.volume.lock() = Some(volume);
        *self.in_flight.lock() = Some(on_finished);

        let _ = self.started.send(source);

        Ok(())
    }

    async fn stop(&self) -> Result<(), PlaybackError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.finish();

        Ok(())
    }

    async fn pause(&self) -> Result<(), PlaybackError> {
        self.paused.store(true, Ordering::SeqCst);

        Ok(())
    }

    async fn resume(&self) -> Result<(), PlaybackError> {
        self.paused.store(false, Ordering::SeqCst);

        Ok(())
    }

    async fn is_playing(&self) -> bool {
        self.in_flight.lock().is_some() && !self.paused.load(Ordering::SeqCst)
    }

    async fn is_paused(&self) -> bool {
        self.in_flight.lock().is_some() && self.paused.load(Ordering::SeqCst)
    }

    async fn set_volume(&self, volume: f32) -> Result<(), PlaybackError> {
        *self.volume.lock() = Some(volume);

        Ok(())
    }

    async fn disconnect(&self) {
        if self.hold_disconnect.load(Ordering::SeqCst) {
            self.disconnecting.notify_one();
            self.disconnect_released.notified().await;
        }

        self.disconnected.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChatChannel for RecordingChannel {
    async fn send(&self, text: &str) {
        self.sent.lock().push(text.to_string());
    }
}
