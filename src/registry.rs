use std::sync::Arc;

use dashmap::DashMap;
use serenity::model::id::GuildId;
use tracing::{info, info_span};
use tracing_futures::Instrument;

use crate::models::TrackInfo;
use crate::session::{PlaybackSession, Position, SessionEnd, SessionParts, SessionSettings};

/// At most one [`PlaybackSession`] per guild. Clones share the same map.
pub struct SessionRegistry<S> {
    sessions: Arc<DashMap<GuildId, Arc<PlaybackSession<S>>>>,
    settings: SessionSettings,
}

impl<S> Clone for SessionRegistry<S> {
    fn clone(&self) -> Self {
        SessionRegistry {
            sessions: Arc::clone(&self.sessions),
            settings: self.settings.clone(),
        }
    }
}

impl<S: Send + 'static> SessionRegistry<S> {
    pub fn new(settings: SessionSettings) -> Self {
        SessionRegistry {
            sessions: Arc::new(DashMap::new()),
            settings,
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<PlaybackSession<S>>> {
        self.sessions.get(&guild_id).map(|session| Arc::clone(session.value()))
    }

    /// Returns the guild's session, creating it (and starting its playback
    /// loop) if there is none. `make` only runs for the caller that creates it.
    pub fn get_or_create(&self, guild_id: GuildId, make: impl FnOnce() -> SessionParts<S>) -> Arc<PlaybackSession<S>> {
        self.with_session(guild_id, make, |_| ()).0
    }

    /// Queues `tracks` on the guild's session, creating it if needed.
    ///
    /// The guild's entry stays locked while queueing, so the tracks can never
    /// land in a session that is being evicted for idling.
    pub fn enqueue(
        &self,
        guild_id: GuildId,
        tracks: impl IntoIterator<Item = TrackInfo>,
        position: Position,
        make: impl FnOnce() -> SessionParts<S>,
    ) -> (Arc<PlaybackSession<S>>, usize) {
        self.with_session(guild_id, make, |session| session.enqueue(tracks, position))
    }

    fn with_session<T>(
        &self,
        guild_id: GuildId,
        make: impl FnOnce() -> SessionParts<S>,
        action: impl FnOnce(&PlaybackSession<S>) -> T,
    ) -> (Arc<PlaybackSession<S>>, T) {
        let mut created = None;

        let (session, result) = {
            let entry = self.sessions.entry(guild_id).or_insert_with(|| {
                info!("Creating a player for guild {}", guild_id.0);

                let session = Arc::new(PlaybackSession::new(guild_id, make(), &self.settings));
                created = Some(Arc::clone(&session));

                session
            });

            let result = action(entry.value());

            (Arc::clone(entry.value()), result)
        };

        if let Some(session) = created {
            self.spawn_player_loop(session);
        }

        (session, result)
    }

    /// Evicts the guild's session and stops its loop.
    pub fn remove(&self, guild_id: GuildId) -> Option<Arc<PlaybackSession<S>>> {
        let (_, session) = self.sessions.remove(&guild_id)?;
        session.shutdown();

        Some(session)
    }

    pub fn shutdown_all(&self) {
        self.sessions.iter().for_each(|session| session.shutdown());
        self.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Drops `session` from the map if it is still the registered one and
    /// nothing was queued since its loop gave up.
    fn evict_idle(&self, session: &Arc<PlaybackSession<S>>) -> bool {
        self.sessions
            .remove_if(&session.guild_id(), |_, existing| Arc::ptr_eq(existing, session) && existing.is_empty())
            .is_some()
    }

    fn spawn_player_loop(&self, session: Arc<PlaybackSession<S>>) {
        let registry = self.clone();
        let guild_id = session.guild_id();

        tokio::spawn(
            async move {
                let end = loop {
                    match session.run().await {
                        SessionEnd::IdleTimeout if registry.evict_idle(&session) => break SessionEnd::IdleTimeout,
                        SessionEnd::IdleTimeout if session.is_shut_down() => break SessionEnd::Disconnected,
                        SessionEnd::IdleTimeout => info!("Tracks were queued as the player went idle, resuming"),
                        SessionEnd::Disconnected => break SessionEnd::Disconnected,
                    }
                };

                info!("Player stopped: {end:?}, {} players left", registry.len());

                if end == SessionEnd::IdleTimeout {
                    // A newer session may already own the voice connection.
                    if registry.get(guild_id).is_none() {
                        session.leave_voice().await;
                    }
                } else {
                    registry.sessions.remove_if(&guild_id, |_, existing| Arc::ptr_eq(existing, &session));
                }
            }
            .instrument(info_span!("player", guild = guild_id.0)),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::Barrier;
    use tokio::time::{sleep, Instant};

    use super::*;
    use crate::error::MusicError;
    use crate::models::Requester;
    use crate::resolver::SourceResolver;
    use crate::session::DEFAULT_IDLE_TIMEOUT;
    use crate::testing::{track, FakeConnection, FakeResolver, RecordingChannel};

    const GUILD: GuildId = GuildId(1);

    struct Harness {
        registry: SessionRegistry<String>,
        resolver: Arc<FakeResolver>,
        connection: Arc<FakeConnection>,
        channel: Arc<RecordingChannel>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_resolver(FakeResolver::default())
        }

        fn with_resolver(resolver: FakeResolver) -> Self {
            Harness {
                registry: SessionRegistry::new(SessionSettings::default()),
                resolver: Arc::new(resolver),
                connection: Arc::new(FakeConnection::default()),
                channel: Arc::new(RecordingChannel::default()),
            }
        }

        fn parts(&self) -> SessionParts<String> {
            SessionParts {
                resolver: self.resolver.clone(),
                connection: self.connection.clone(),
                channel: self.channel.clone(),
            }
        }

        fn session(&self) -> Arc<PlaybackSession<String>> {
            self.registry.get_or_create(GUILD, || self.parts())
        }

        async fn wait_until_evicted(&self) {
            while self.registry.get(GUILD).is_some() {
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    #[tokio::test]
    async fn plays_tracks_in_order() {
        let harness = Harness::new();
        let session = harness.session();
        session.enqueue(["a", "b", "c"].map(track), Position::Back);

        let mut played = Vec::new();
        for _ in 0..3 {
            played.push(harness.connection.next_started().await);
            harness.connection.finish();
        }

        assert_eq!(played, vec!["a", "b", "c"]);
        assert!(harness.channel.sent().iter().any(|text| text.contains("**Now Playing:** `a`")));
    }

    #[tokio::test]
    async fn looping_the_queue_repeats_it_until_disconnect() {
        let harness = Harness::new();
        let session = harness.session();
        session.toggle_loop_queue();
        session.enqueue(["a", "b", "c"].map(track), Position::Back);

        let mut played = Vec::new();
        for _ in 0..7 {
            played.push(harness.connection.next_started().await);
            harness.connection.finish();
        }

        assert_eq!(played, vec!["a", "b", "c", "a", "b", "c", "a"]);

        harness.registry.remove(GUILD);
        assert!(harness.registry.get(GUILD).is_none());
        assert!(session.is_shut_down());
    }

    #[tokio::test]
    async fn looping_a_song_replays_it() {
        let harness = Harness::new();
        let session = harness.session();
        session.toggle_loop_song();
        session.enqueue(["a", "b"].map(track), Position::Back);

        assert_eq!(harness.connection.next_started().await, "a");
        harness.connection.finish();
        assert_eq!(harness.connection.next_started().await, "a");

        session.toggle_loop_song();
        harness.connection.finish();
        assert_eq!(harness.connection.next_started().await, "b");
    }

    #[tokio::test]
    async fn skipping_still_recycles_the_track() {
        let harness = Harness::new();
        let session = harness.session();
        session.toggle_loop_queue();
        session.enqueue(["a", "b"].map(track), Position::Back);

        assert_eq!(harness.connection.next_started().await, "a");
        assert!(session.skip().await.unwrap());
        assert_eq!(harness.connection.next_started().await, "b");
        assert_eq!(session.peek_page(10, 0)[0].title, "a");
    }

    #[tokio::test]
    async fn unplayable_tracks_are_reported_and_skipped() {
        let harness = Harness::with_resolver(FakeResolver::failing_on(&["gone"]));
        let session = harness.session();
        session.toggle_loop_queue();
        session.enqueue(["gone", "here"].map(track), Position::Back);

        assert_eq!(harness.connection.next_started().await, "here");

        let sent = harness.channel.sent();
        assert!(sent[0].starts_with("Error:"));
        assert!(sent[0].contains("gone"));
        // Dropped, not recycled.
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn playback_errors_do_not_stop_the_player() {
        let harness = Harness::new();
        let session = harness.session();
        session.enqueue(["a", "b"].map(track), Position::Back);

        assert_eq!(harness.connection.next_started().await, "a");
        harness.connection.fail("decoder crashed");
        assert_eq!(harness.connection.next_started().await, "b");

        assert!(harness.channel.sent().iter().any(|text| text.contains("decoder crashed")));
        assert!(harness.registry.get(GUILD).is_some());
    }

    #[tokio::test]
    async fn searched_tracks_land_in_the_queue() {
        let harness = Harness::new();
        let requester = Requester { id: serenity::model::id::UserId(5), name: "dj#0005".to_string() };

        let tracks = harness.resolver.search("a, b", &requester).await.unwrap();
        let session = harness.session();
        assert_eq!(session.enqueue(tracks, Position::Back), 2);

        assert_eq!(harness.connection.next_started().await, "a");
        assert!(matches!(
            harness.resolver.search(" , ", &requester).await.map_err(MusicError::from),
            Err(MusicError::Resolution(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_disconnect_and_leave_the_registry() {
        let harness = Harness::new();
        let start = Instant::now();
        let session = harness.session();

        harness.wait_until_evicted().await;

        assert!(start.elapsed() >= DEFAULT_IDLE_TIMEOUT);
        assert!(start.elapsed() < DEFAULT_IDLE_TIMEOUT + Duration::from_secs(2));
        assert!(harness.connection.is_disconnected());
        assert!(!session.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn a_track_just_before_the_deadline_keeps_the_session() {
        let harness = Harness::new();
        let session = harness.session();

        sleep(DEFAULT_IDLE_TIMEOUT - Duration::from_secs(1)).await;
        session.enqueue([track("late")], Position::Back);

        assert_eq!(harness.connection.next_started().await, "late");
        assert!(harness.registry.get(GUILD).is_some());
        assert!(!harness.connection.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_restarts_after_each_track() {
        let harness = Harness::new();
        let session = harness.session();
        session.enqueue([track("a")], Position::Back);

        assert_eq!(harness.connection.next_started().await, "a");
        sleep(DEFAULT_IDLE_TIMEOUT * 2).await;
        harness.connection.finish();

        let finished_at = Instant::now();
        harness.wait_until_evicted().await;

        assert!(finished_at.elapsed() >= DEFAULT_IDLE_TIMEOUT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_commands_share_one_session() {
        let harness = Arc::new(Harness::new());
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|title| {
                let harness = Arc::clone(&harness);
                let created = Arc::clone(&created);
                let barrier = Arc::clone(&barrier);

                tokio::spawn(async move {
                    barrier.wait().await;

                    let session = harness.registry.get_or_create(GUILD, || {
                        created.fetch_add(1, Ordering::SeqCst);
                        harness.parts()
                    });
                    session.enqueue([track(title)], Position::Back);

                    session
                })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(harness.registry.len(), 1);
        assert!(Arc::ptr_eq(&sessions[0], &sessions[1]));

        harness.connection.next_started().await;
        assert_eq!(sessions[0].len(), 1);
        assert!(sessions[0].now_playing().track.is_some());
    }

    #[tokio::test]
    async fn a_replaced_session_is_not_evicted_by_its_predecessor() {
        let harness = Harness::new();
        let old = harness.session();

        harness.registry.remove(GUILD);
        let new = harness.session();
        assert!(!Arc::ptr_eq(&old, &new));

        // Let the old loop observe its shutdown.
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(10)).await;

        assert!(harness.registry.get(GUILD).is_some_and(|current| Arc::ptr_eq(&current, &new)));
    }

    #[tokio::test]
    async fn removing_a_playing_session_stops_the_track() {
        let harness = Harness::new();
        let session = harness.session();
        session.enqueue(["a", "b"].map(track), Position::Back);

        assert_eq!(harness.connection.next_started().await, "a");
        harness.registry.remove(GUILD);

        while session.now_playing().track.is_some() {
            tokio::task::yield_now().await;
        }

        assert_eq!(harness.connection.stop_count(), 1);
        assert_eq!(session.len(), 1);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(harness.connection.try_next_started(), None);
        assert!(harness.registry.get(GUILD).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_track_queued_while_leaving_voice_gets_a_fresh_session() {
        let harness = Harness::new();
        harness.connection.hold_disconnect();
        let idle = harness.session();

        harness.connection.disconnecting().await;

        let (session, added) = harness.registry.enqueue(GUILD, [track("late")], Position::Back, || harness.parts());
        assert_eq!(added, 1);
        assert!(!Arc::ptr_eq(&idle, &session));
        assert_eq!(harness.connection.next_started().await, "late");

        harness.connection.release_disconnect();
        sleep(Duration::from_secs(1)).await;

        assert!(idle.is_empty());
        assert!(harness.registry.get(GUILD).is_some_and(|current| Arc::ptr_eq(&current, &session)));
    }

    #[tokio::test]
    async fn idle_eviction_spares_a_session_with_pending_tracks() {
        let harness = Harness::new();
        let session = Arc::new(PlaybackSession::new(GUILD, harness.parts(), &SessionSettings::default()));
        harness.registry.sessions.insert(GUILD, Arc::clone(&session));

        session.enqueue([track("late")], Position::Back);
        assert!(!harness.registry.evict_idle(&session));
        assert!(harness.registry.get(GUILD).is_some());

        session.remove(0).unwrap();
        assert!(harness.registry.evict_idle(&session));
        assert!(harness.registry.get(GUILD).is_none());
    }
}
