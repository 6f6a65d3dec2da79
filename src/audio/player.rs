use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    clock::PositionClock,
    pipeline::{Pipeline, PipelineHandle, StreamFactory},
    queue::MusicQueue,
    transport::{AudioResource, EventSink, PlayerEvent, VoiceConnection, VoiceTransport},
};
use crate::{
    error::{PlayerError, PlayerResult},
    sources::{
        formats::{FormatResolver, SeekOptions},
        QueuedSong,
    },
    storage::GuildSettingsProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayerStatus {
    Playing,
    Paused,
    Idle,
}

impl PlayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerStatus::Playing => "Playing",
            PlayerStatus::Paused => "Paused",
            PlayerStatus::Idle => "Idle",
        }
    }
}

/// Posts "now playing" notices after the player moves on by itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn now_playing(&self, channel_id: ChannelId, song: &QueuedSong, queue_size: usize);
}

/// Collaborators shared by every player.
#[derive(Clone)]
pub struct PlayerServices {
    pub transport: Arc<dyn VoiceTransport>,
    pub resolver: Arc<FormatResolver>,
    pub streams: Arc<dyn StreamFactory>,
    pub settings: Arc<dyn GuildSettingsProvider>,
    pub announcer: Arc<dyn Announcer>,
}

/// One pipeline plus the voice resource reading from it.
struct PlaybackSession {
    id: u64,
    song: QueuedSong,
    pipeline: PipelineHandle,
    resource: Box<dyn AudioResource>,
}

impl PlaybackSession {
    fn stop(&self) {
        self.resource.stop();
        self.pipeline.stop();
        debug!("Session {} stopped", self.id);
    }
}

struct PlayerState {
    status: PlayerStatus,
    connection: Option<Arc<dyn VoiceConnection>>,
    session: Option<PlaybackSession>,
    loop_current_song: bool,
    loop_current_queue: bool,
    volume: Option<u8>,
    default_volume: u8,
    last_song_url: Option<String>,
    last_failure: Option<String>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            status: PlayerStatus::Idle,
            connection: None,
            session: None,
            loop_current_song: false,
            loop_current_queue: false,
            volume: None,
            default_volume: 100,
            last_song_url: None,
            last_failure: None,
        }
    }
}

/// Playback state machine for one guild.
///
/// Operations that change what is audible (`connect`, `play`, `pause`, `seek`,
/// `forward`, `back`, `disconnect`, `stop`) are serialized by an async control
/// lock, so a second call waits for the first to finish instead of racing it.
/// Queue edits and reads never wait on that lock.
///
/// Voice events arrive on a channel drained by a single task per player; idle
/// events name the session they belong to, so an event for a superseded
/// session is dropped.
pub struct Player {
    guild_id: GuildId,
    services: PlayerServices,
    me: Weak<Player>,
    control: tokio::sync::Mutex<()>,
    state: Mutex<PlayerState>,
    queue: RwLock<MusicQueue>,
    clock: PositionClock,
    events: EventSink,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    next_session: AtomicU64,
}

impl Player {
    pub fn new(guild_id: GuildId, services: PlayerServices) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();

        let player = Arc::new_cyclic(|me| Self {
            guild_id,
            services,
            me: me.clone(),
            control: tokio::sync::Mutex::new(()),
            state: Mutex::new(PlayerState::default()),
            queue: RwLock::new(MusicQueue::new()),
            clock: PositionClock::new(),
            events,
            idle_timer: Mutex::new(None),
            next_session: AtomicU64::new(0),
        });

        tokio::spawn(Self::event_loop(Arc::downgrade(&player), rx));
        player
    }

    async fn event_loop(player: Weak<Player>, mut rx: mpsc::UnboundedReceiver<PlayerEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(player) = player.upgrade() else { break };
            player.handle_event(event).await;
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    // ----- transport controls -----

    pub async fn connect(&self, channel_id: ChannelId) -> PlayerResult<()> {
        let _guard = self.control.lock().await;

        let connection = self
            .services
            .transport
            .connect(self.guild_id, channel_id, self.events.clone())
            .await?;
        let settings = self.services.settings.get(self.guild_id).await;

        let mut state = self.state.lock();
        state.connection = Some(Arc::from(connection));
        state.default_volume = settings.default_volume.min(100);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let _guard = self.control.lock().await;
        self.disconnect_locked().await;
    }

    async fn disconnect_locked(&self) {
        self.suspend_for_disconnect();
        self.cancel_idle_timer();

        let (connection, session) = {
            let mut state = self.state.lock();
            state.loop_current_song = false;
            state.loop_current_queue = false;
            (state.connection.take(), state.session.take())
        };

        if let Some(session) = session {
            session.stop();
        }
        if let Some(connection) = connection {
            connection.destroy().await;
            info!("🔌 Player disconnected in guild {}", self.guild_id);
        }
    }

    /// Freezes a playing player so a later `play()` picks up at the same
    /// position, even when the resource refuses to pause.
    fn suspend_for_disconnect(&self) {
        let mut state = self.state.lock();
        if state.status != PlayerStatus::Playing {
            return;
        }

        if let Some(session) = &state.session {
            if let Err(e) = session.resource.pause() {
                debug!("Could not pause resource before disconnect: {}", e);
            }
        }
        state.status = PlayerStatus::Paused;
        self.clock.stop();
    }

    /// Disconnects and empties the queue.
    pub async fn stop(&self) {
        let _guard = self.control.lock().await;
        self.disconnect_locked().await;

        self.queue.write().reset();
        self.clock.reset(0);
        self.state.lock().status = PlayerStatus::Idle;
        info!("⏹️ Playback stopped in guild {}", self.guild_id);
    }

    pub async fn play(&self) -> PlayerResult<()> {
        let _guard = self.control.lock().await;
        self.play_locked().await
    }

    async fn play_locked(&self) -> PlayerResult<()> {
        let connection = self.connection()?;
        let current = self.get_current().ok_or(PlayerError::QueueEmpty)?;
        self.cancel_idle_timer();

        if self.status() == PlayerStatus::Paused {
            let resumed = {
                let state = self.state.lock();
                match &state.session {
                    Some(session) if session.song == current => Some(session.resource.resume()),
                    _ => None,
                }
            };

            match resumed {
                Some(Ok(())) => {
                    self.state.lock().status = PlayerStatus::Playing;
                    self.clock.start(None);
                    info!("▶️ Resumed: {}", current.title);
                    return Ok(());
                }
                Some(Err(e)) => debug!("Paused resource is gone, rebuilding: {}", e),
                None => {}
            }

            // Resource was torn down (disconnect): pick up where we left off.
            let same_song = self.state.lock().last_song_url.as_deref() == Some(current.url.as_str());
            let position = self.clock.position();
            if same_song && !current.is_live && position <= current.length {
                return self.seek_locked(position).await;
            }
        }

        let mut song = current;
        loop {
            match self.start_session(&connection, &song, 0).await {
                Ok(session) => {
                    self.install_session(session);
                    self.clock.start(Some(0));
                    info!("🎵 Now playing: {}", song.title);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!("⏭️ Skipping {}: {}", song.title, e);
                    if let PlayerError::SourceGone(reason) = &e {
                        self.state.lock().last_failure = Some(format!("{}: {}", song.url, reason));
                    }

                    self.clock.reset(0);
                    let next = {
                        let mut queue = self.queue.write();
                        match queue.advance(1) {
                            Ok(()) => queue.current().cloned(),
                            Err(_) => None,
                        }
                    };

                    match next {
                        Some(next) => song = next,
                        None => {
                            self.go_idle().await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolves `song` and subscribes a new resource starting `start` seconds in.
    async fn start_session(
        &self,
        connection: &Arc<dyn VoiceConnection>,
        song: &QueuedSong,
        start: u64,
    ) -> PlayerResult<PlaybackSession> {
        let options = SeekOptions {
            seek: Some(song.offset + start).filter(|s| *s > 0),
            to: (song.length > 0 && !song.is_live).then_some(song.length + song.offset),
        };

        let input = self.services.resolver.resolve(song, options).await?;
        let Pipeline { stream, handle } = self.services.streams.open(input).await?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let resource = match connection.play(stream, id, self.events.clone()).await {
            Ok(resource) => resource,
            Err(e) => {
                handle.stop();
                return Err(e);
            }
        };

        if let Err(e) = resource.set_volume(self.get_volume()) {
            warn!("Could not apply volume to new track: {}", e);
        }

        Ok(PlaybackSession {
            id,
            song: song.clone(),
            pipeline: handle,
            resource,
        })
    }

    /// Makes `session` the live one and stops whatever it replaces.
    fn install_session(&self, session: PlaybackSession) {
        let previous = {
            let mut state = self.state.lock();
            state.status = PlayerStatus::Playing;
            state.last_song_url = Some(session.song.url.clone());
            state.session.replace(session)
        };

        if let Some(previous) = previous {
            previous.stop();
        }
    }

    pub async fn pause(&self) -> PlayerResult<()> {
        let _guard = self.control.lock().await;
        self.pause_locked()
    }

    fn pause_locked(&self) -> PlayerResult<()> {
        let mut state = self.state.lock();
        if state.status != PlayerStatus::Playing {
            return Err(PlayerError::NotPlaying);
        }

        if let Some(session) = &state.session {
            session.resource.pause()?;
        }
        state.status = PlayerStatus::Paused;
        self.clock.stop();
        info!("⏸️ Playback paused in guild {}", self.guild_id);
        Ok(())
    }

    pub async fn seek(&self, position: u64) -> PlayerResult<()> {
        let _guard = self.control.lock().await;
        self.seek_locked(position).await
    }

    pub async fn forward_seek(&self, delta: u64) -> PlayerResult<()> {
        let _guard = self.control.lock().await;
        let current = self.get_current().ok_or(PlayerError::QueueEmpty)?;
        let target = self
            .clock
            .position()
            .checked_add(delta)
            .ok_or(PlayerError::SeekOutOfRange {
                target: u64::MAX,
                length: current.length,
            })?;
        self.seek_locked(target).await
    }

    async fn seek_locked(&self, position: u64) -> PlayerResult<()> {
        let connection = self.connection()?;
        let current = self.get_current().ok_or(PlayerError::QueueEmpty)?;

        if current.is_live {
            return Err(PlayerError::LiveSeek);
        }
        if position > current.length {
            return Err(PlayerError::SeekOutOfRange {
                target: position,
                length: current.length,
            });
        }

        self.cancel_idle_timer();
        let session = self.start_session(&connection, &current, position).await?;
        self.install_session(session);
        self.clock.start(Some(position));
        info!("⏩ Seeked to {}s in {}", position, current.title);
        Ok(())
    }

    pub async fn forward(&self, skip: usize) -> PlayerResult<()> {
        let _guard = self.control.lock().await;
        self.forward_locked(skip).await
    }

    async fn forward_locked(&self, skip: usize) -> PlayerResult<()> {
        let original = {
            let mut queue = self.queue.write();
            let original = queue.position();
            queue.advance(skip)?;
            original
        };
        self.clock.reset(0);
        self.cancel_idle_timer();

        // A paused player does not start the next song on its own.
        if self.get_current().is_none() || self.status() == PlayerStatus::Paused {
            self.go_idle().await;
            return Ok(());
        }

        if let Err(e) = self.play_locked().await {
            self.queue.write().restore_position(original);
            return Err(e);
        }
        Ok(())
    }

    pub async fn back(&self) -> PlayerResult<()> {
        let _guard = self.control.lock().await;

        let original = {
            let mut queue = self.queue.write();
            let original = queue.position();
            queue.retreat()?;
            original
        };
        self.clock.reset(0);
        self.cancel_idle_timer();

        if self.status() != PlayerStatus::Paused {
            if let Err(e) = self.play_locked().await {
                self.queue.write().restore_position(original);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Nothing left to play: stop the resource and maybe leave later.
    async fn go_idle(&self) {
        let previous = {
            let mut state = self.state.lock();
            state.status = PlayerStatus::Idle;
            state.session.take()
        };
        if let Some(previous) = previous {
            previous.stop();
        }
        self.clock.reset(0);
        info!("⏹️ Nothing playing in guild {}", self.guild_id);

        let wait = self
            .services
            .settings
            .get(self.guild_id)
            .await
            .seconds_to_wait_after_queue_empties;
        if wait > 0 {
            self.arm_idle_timer(Duration::from_secs(wait));
        }
    }

    fn arm_idle_timer(&self, wait: Duration) {
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(player) = me.upgrade() else { return };

            let _guard = player.control.lock().await;
            // Detach ourselves so the disconnect below doesn't abort this task.
            player.idle_timer.lock().take();
            if player.status() == PlayerStatus::Idle {
                info!("💤 Idle for {}s, leaving voice in guild {}", wait.as_secs(), player.guild_id);
                player.disconnect_locked().await;
            }
        });

        if let Some(previous) = self.idle_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.abort();
            debug!("Idle disconnect cancelled in guild {}", self.guild_id);
        }
    }

    fn connection(&self) -> PlayerResult<Arc<dyn VoiceConnection>> {
        self.state.lock().connection.clone().ok_or(PlayerError::NotConnected)
    }

    // ----- voice events -----

    async fn handle_event(&self, event: PlayerEvent) {
        let _guard = self.control.lock().await;

        match event {
            PlayerEvent::TrackIdle { session } => {
                let is_live_session = {
                    let state = self.state.lock();
                    state.status == PlayerStatus::Playing
                        && state.session.as_ref().map(|s| s.id) == Some(session)
                };
                if !is_live_session {
                    debug!("Ignoring idle event for stale session {}", session);
                    return;
                }
                self.on_track_idle().await;
            }
            PlayerEvent::Disconnected => {
                if self.state.lock().connection.is_some() {
                    self.disconnect_locked().await;
                }
            }
        }
    }

    async fn on_track_idle(&self) {
        let (loop_song, loop_queue) = {
            let state = self.state.lock();
            (state.loop_current_song, state.loop_current_queue)
        };

        if loop_song {
            match self.seek_locked(0).await {
                Ok(()) => return,
                Err(e) => warn!("Could not replay looped song: {}", e),
            }
        }

        if loop_queue {
            if let Some(finished) = self.get_current() {
                self.queue.write().add(finished, false);
            }
        }

        if let Err(e) = self.forward_locked(1).await {
            error!("Error advancing queue in guild {}: {}", self.guild_id, e);
            self.go_idle().await;
            return;
        }

        let settings = self.services.settings.get(self.guild_id).await;
        if !settings.auto_announce_next_song || self.status() != PlayerStatus::Playing {
            return;
        }
        let Some(current) = self.get_current() else { return };

        // Posting goes over the network; don't hold the control lock for it.
        let announcer = self.services.announcer.clone();
        let queue_size = self.queue_size();
        tokio::spawn(async move {
            announcer
                .now_playing(current.added_in_channel_id, &current, queue_size)
                .await;
        });
    }

    // ----- queue -----

    pub fn add(&self, song: QueuedSong, insert_at_front: bool) {
        self.queue.write().add(song, insert_at_front);
    }

    pub fn shuffle(&self) {
        self.queue.write().shuffle_ahead();
    }

    pub fn clear(&self) {
        self.queue.write().clear();
    }

    pub fn remove_from_queue(&self, index: usize, amount: usize) -> PlayerResult<Vec<QueuedSong>> {
        self.queue.write().remove_range(index, amount)
    }

    pub fn move_song(&self, from: usize, to: usize) -> PlayerResult<QueuedSong> {
        self.queue.write().move_song(from, to).cloned()
    }

    pub fn get_current(&self) -> Option<QueuedSong> {
        self.queue.read().current().cloned()
    }

    pub fn get_queue(&self) -> Vec<QueuedSong> {
        self.queue.read().ahead().to_vec()
    }

    pub fn get_queue_history(&self) -> Vec<QueuedSong> {
        self.queue.read().history().to_vec()
    }

    pub fn get_queue_position(&self) -> usize {
        self.queue.read().position()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.read().size()
    }

    /// Seconds of music queued after the current song.
    pub fn queue_length(&self) -> u64 {
        self.queue.read().total_ahead_length()
    }

    /// Elapsed seconds in the current song.
    pub fn get_position(&self) -> u64 {
        self.clock.position()
    }

    // ----- state -----

    pub fn status(&self) -> PlayerStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn loop_current_song(&self) -> bool {
        self.state.lock().loop_current_song
    }

    pub fn set_loop_current_song(&self, enabled: bool) {
        self.state.lock().loop_current_song = enabled;
    }

    pub fn loop_current_queue(&self) -> bool {
        self.state.lock().loop_current_queue
    }

    pub fn set_loop_current_queue(&self, enabled: bool) {
        self.state.lock().loop_current_queue = enabled;
    }

    /// Last song dropped because its source no longer exists.
    pub fn last_failure(&self) -> Option<String> {
        self.state.lock().last_failure.clone()
    }

    // ----- volume -----

    pub fn get_volume(&self) -> u8 {
        let state = self.state.lock();
        state.volume.unwrap_or(state.default_volume)
    }

    pub fn set_volume(&self, volume: u16) -> PlayerResult<()> {
        let volume = u8::try_from(volume)
            .ok()
            .filter(|v| *v <= 100)
            .ok_or(PlayerError::InvalidVolume(volume))?;

        self.state.lock().volume = Some(volume);
        self.apply_volume()
    }

    pub fn reset_volume(&self) -> PlayerResult<()> {
        self.state.lock().volume = None;
        self.apply_volume()
    }

    fn apply_volume(&self) -> PlayerResult<()> {
        let volume = self.get_volume();
        match &self.state.lock().session {
            Some(session) => session.resource.set_volume(volume),
            None => Ok(()),
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.get_mut().take() {
            timer.abort();
        }
        if let Some(session) = self.state.get_mut().session.take() {
            session.stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::{
        audio::{pipeline::test_support::FakeStreamFactory, transport::test_support::RecordingTransport},
        cache::test_support::MemoryCache,
        config::PipelineConfig,
        sources::formats::MockFormatProbe,
        storage::MockGuildSettingsProvider,
    };

    /// Services for players that are only used for queue bookkeeping.
    pub fn inert_services() -> PlayerServices {
        PlayerServices {
            transport: Arc::new(RecordingTransport::default()),
            resolver: Arc::new(FormatResolver::new(
                Arc::new(MemoryCache::default()),
                Arc::new(MockFormatProbe::new()),
                Arc::new(PipelineConfig::default()),
            )),
            streams: Arc::new(FakeStreamFactory::default()),
            settings: Arc::new(MockGuildSettingsProvider::new()),
            announcer: Arc::new(MockAnnouncer::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            pipeline::test_support::FakeStreamFactory,
            transport::test_support::{RecordingTransport, TransportCall, TransportLog},
        },
        cache::test_support::MemoryCache,
        config::PipelineConfig,
        error::ErrorKind,
        sources::{
            formats::{AudioFormat, InputSource, MockFormatProbe, ProbeInfo},
            test_support::song,
            MediaSource, SongMetadata,
        },
        storage::{GuildSettings, MockGuildSettingsProvider},
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    const VOICE: ChannelId = ChannelId::new(10);

    struct Harness {
        player: Arc<Player>,
        log: Arc<TransportLog>,
        streams: Arc<FakeStreamFactory>,
        cache: Arc<MemoryCache>,
    }

    fn settings(wait: u64, announce: bool) -> MockGuildSettingsProvider {
        let mut settings = MockGuildSettingsProvider::new();
        settings.expect_get().returning(move |guild_id| GuildSettings {
            guild_id: guild_id.get(),
            default_volume: 80,
            seconds_to_wait_after_queue_empties: wait,
            auto_announce_next_song: announce,
        });
        settings
    }

    /// Songs whose URL mentions "broken" fail to probe, "gone" ones have been removed.
    fn probe() -> MockFormatProbe {
        let mut probe = MockFormatProbe::new();
        probe.expect_probe().returning(|url| {
            if url.contains("broken") {
                return Err(PlayerError::Probe("unable to extract".into()));
            }
            if url.contains("gone") {
                return Err(PlayerError::SourceGone("Video unavailable".into()));
            }
            Ok(ProbeInfo {
                formats: vec![AudioFormat {
                    url: format!("{url}&audio"),
                    itag: "251".into(),
                    codec: Some("opus".into()),
                    container: Some("webm".into()),
                    sample_rate: Some(48_000),
                    ..Default::default()
                }],
                is_live: false,
                length: 180,
            })
        });
        probe
    }

    fn harness_with(settings: MockGuildSettingsProvider, announcer: MockAnnouncer) -> Harness {
        let transport = RecordingTransport::default();
        let log = transport.log.clone();
        let streams = Arc::new(FakeStreamFactory::default());
        let cache = Arc::new(MemoryCache::default());

        let services = PlayerServices {
            transport: Arc::new(transport),
            resolver: Arc::new(FormatResolver::new(
                cache.clone(),
                Arc::new(probe()),
                Arc::new(PipelineConfig::default()),
            )),
            streams: streams.clone(),
            settings: Arc::new(settings),
            announcer: Arc::new(announcer),
        };

        Harness {
            player: Player::new(GuildId::new(1), services),
            log,
            streams,
            cache,
        }
    }

    fn harness() -> Harness {
        harness_with(settings(0, false), MockAnnouncer::new())
    }

    async fn connected_with(names: &[&str]) -> Harness {
        let h = harness();
        h.player.connect(VOICE).await.unwrap();
        for name in names {
            h.player.add(song(name), false);
        }
        h
    }

    /// Lets the event loop and any woken timers run.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance_secs(secs: u64) {
        for _ in 0..secs {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        settle().await;
    }

    fn plays(log: &TransportLog) -> usize {
        log.calls().iter().filter(|c| matches!(c, TransportCall::Play(_))).count()
    }

    #[tokio::test]
    async fn test_play_requires_connection_and_song() {
        let h = harness();
        h.player.add(song("a"), false);
        assert!(matches!(h.player.play().await, Err(PlayerError::NotConnected)));

        let h = harness();
        h.player.connect(VOICE).await.unwrap();
        assert!(matches!(h.player.play().await, Err(PlayerError::QueueEmpty)));
        assert_eq!(h.player.status(), PlayerStatus::Idle);
    }

    #[tokio::test]
    async fn test_play_starts_session_with_guild_volume() {
        let h = connected_with(&["a", "b"]).await;
        h.player.play().await.unwrap();

        assert_eq!(h.player.status(), PlayerStatus::Playing);
        assert_eq!(h.player.get_volume(), 80);
        assert_eq!(h.log.calls(), vec![
            TransportCall::Connect(VOICE),
            TransportCall::Play(1),
            TransportCall::Volume(1, 80),
        ]);

        let opened = h.streams.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(
            opened[0].source,
            InputSource::Url("https://www.youtube.com/watch?v=a&audio".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_clock_and_play_resumes_same_resource() {
        let h = connected_with(&["a"]).await;
        assert!(matches!(h.player.pause().await, Err(PlayerError::NotPlaying)));

        h.player.play().await.unwrap();
        advance_secs(4).await;
        h.player.pause().await.unwrap();
        assert_eq!(h.player.status(), PlayerStatus::Paused);

        advance_secs(10).await;
        assert_eq!(h.player.get_position(), 4);
        assert!(h.player.pause().await.is_err());

        h.player.play().await.unwrap();
        advance_secs(2).await;
        assert_eq!(h.player.get_position(), 6);
        assert_eq!(plays(&h.log), 1);
        assert!(h.log.calls().contains(&TransportCall::Resume(1)));
    }

    #[tokio::test]
    async fn test_seek_past_end_fails_without_state_change() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();

        let err = h.player.seek(181).await.unwrap_err();
        assert!(matches!(err, PlayerError::SeekOutOfRange { target: 181, length: 180 }));
        assert_eq!(h.player.status(), PlayerStatus::Playing);
        assert_eq!(plays(&h.log), 1);
    }

    #[tokio::test]
    async fn test_seek_restarts_pipeline_at_target() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();
        h.player.seek(60).await.unwrap();

        assert_eq!(h.player.get_position(), 60);
        assert!(h.log.calls().contains(&TransportCall::Stop(1)));
        assert_eq!(h.log.last_session(), Some(2));

        let opened = h.streams.opened();
        let seeked = opened.last().unwrap();
        assert!(seeked.input_options.windows(2).any(|w| w == ["-ss", "60"]));
        assert!(seeked.input_options.windows(2).any(|w| w == ["-to", "180"]));
        assert_eq!(seeked.cache_key, None);
    }

    #[tokio::test]
    async fn test_seek_on_live_stream_fails() {
        let h = connected_with(&[]).await;
        let mut live = song("radio");
        live.metadata = SongMetadata::new("radio", "https://radio/live.m3u8", MediaSource::Hls).with_live(true);
        h.player.add(live, false);
        h.player.play().await.unwrap();

        assert!(matches!(h.player.seek(10).await, Err(PlayerError::LiveSeek)));
        assert_eq!(h.streams.opened()[0].input_options, vec!["-re"]);
    }

    #[tokio::test]
    async fn test_forward_too_far_changes_nothing() {
        let h = connected_with(&["a", "b"]).await;
        h.player.play().await.unwrap();

        assert!(matches!(h.player.forward(3).await, Err(PlayerError::NothingToForward)));
        assert_eq!(h.player.get_queue_position(), 0);
        assert_eq!(h.player.status(), PlayerStatus::Playing);
        assert_eq!(plays(&h.log), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_then_back_returns_to_original_song() {
        let h = connected_with(&["a", "b", "c"]).await;
        h.player.play().await.unwrap();
        advance_secs(5).await;
        assert_eq!(h.player.get_position(), 5);

        h.player.forward(1).await.unwrap();
        assert_eq!(h.player.get_current().unwrap().title, "b");
        assert_eq!(h.player.get_position(), 0);

        advance_secs(3).await;
        h.player.back().await.unwrap();
        assert_eq!(h.player.get_current().unwrap().title, "a");
        assert_eq!(h.player.get_queue_position(), 0);
        assert_eq!(h.player.get_position(), 0);
        assert_eq!(plays(&h.log), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_while_paused_goes_idle() {
        let h = harness_with(settings(30, false), MockAnnouncer::new());
        h.player.connect(VOICE).await.unwrap();
        h.player.add(song("a"), false);
        h.player.add(song("b"), false);
        h.player.play().await.unwrap();
        h.player.pause().await.unwrap();

        h.player.forward(1).await.unwrap();
        assert_eq!(h.player.get_current().unwrap().title, "b");
        assert_eq!(h.player.status(), PlayerStatus::Idle);
        assert_eq!(plays(&h.log), 1);
        assert!(h.log.calls().contains(&TransportCall::Stop(1)));

        advance_secs(31).await;
        assert!(!h.player.is_connected());
        assert_eq!(h.log.calls().last(), Some(&TransportCall::Destroy));
    }

    #[tokio::test]
    async fn test_play_after_paused_forward_starts_next_song() {
        let h = connected_with(&["a", "b"]).await;
        h.player.play().await.unwrap();
        h.player.pause().await.unwrap();
        h.player.forward(1).await.unwrap();

        h.player.play().await.unwrap();
        assert_eq!(plays(&h.log), 2);
        assert_eq!(h.player.status(), PlayerStatus::Playing);
        assert_eq!(h.streams.opened()[1].source, InputSource::Url("https://www.youtube.com/watch?v=b&audio".into()));
    }

    #[tokio::test]
    async fn test_unplayable_song_is_skipped() {
        let h = connected_with(&["a", "broken", "gone", "d"]).await;
        h.player.play().await.unwrap();

        h.player.forward(1).await.unwrap();
        assert_eq!(h.player.get_current().unwrap().title, "d");
        assert_eq!(h.player.status(), PlayerStatus::Playing);
        assert!(h.player.last_failure().unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn test_failing_last_songs_leave_player_idle() {
        let h = connected_with(&["broken"]).await;
        h.player.play().await.unwrap();

        assert_eq!(h.player.status(), PlayerStatus::Idle);
        assert!(h.player.get_current().is_none());
        assert_eq!(plays(&h.log), 0);
    }

    #[tokio::test]
    async fn test_forward_restores_cursor_when_play_fails() {
        let h = connected_with(&["a", "b"]).await;
        let missing = QueuedSong::new(
            SongMetadata::new("Cached Song (deadbeef)", "deadbeef", MediaSource::Cache),
            UserId::new(1),
            "tester",
            ChannelId::new(2),
        );
        h.player.add(missing, false);
        h.player.play().await.unwrap();

        let err = h.player.forward(2).await.unwrap_err();
        assert!(matches!(err, PlayerError::CacheMiss(_)));
        assert_eq!(h.player.get_queue_position(), 0);

        // Once the entry exists the same skip works.
        h.cache.insert("deadbeef");
        h.player.forward(2).await.unwrap();
        assert_eq!(h.player.get_queue_position(), 2);
        assert_eq!(
            h.streams.opened().last().unwrap().source,
            InputSource::File("/cache/deadbeef".into())
        );
    }

    #[tokio::test]
    async fn test_idle_event_advances_and_ignores_stale_sessions() {
        let h = connected_with(&["a", "b"]).await;
        h.player.play().await.unwrap();
        h.player.seek(10).await.unwrap();

        // Session 1 was superseded by the seek.
        h.log.finish(1);
        settle().await;
        assert_eq!(h.player.get_current().unwrap().title, "a");

        h.log.finish(2);
        settle().await;
        assert_eq!(h.player.get_current().unwrap().title, "b");
        assert_eq!(h.log.last_session(), Some(3));
    }

    #[tokio::test]
    async fn test_loop_current_song_replays_from_start() {
        let h = connected_with(&["a", "b"]).await;
        h.player.set_loop_current_song(true);
        h.player.play().await.unwrap();

        h.log.finish(1);
        settle().await;
        assert_eq!(h.player.get_current().unwrap().title, "a");
        assert_eq!(h.player.get_position(), 0);
        assert_eq!(h.log.last_session(), Some(2));
    }

    #[tokio::test]
    async fn test_loop_queue_requeues_finished_song() {
        let h = connected_with(&["a", "b"]).await;
        h.player.set_loop_current_queue(true);
        h.player.play().await.unwrap();

        h.log.finish(1);
        settle().await;
        assert_eq!(h.player.get_current().unwrap().title, "b");
        let ahead: Vec<String> = h.player.get_queue().into_iter().map(|s| s.title.clone()).collect();
        assert_eq!(ahead, vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_disconnect_after_queue_ends() {
        let h = harness_with(settings(30, false), MockAnnouncer::new());
        h.player.connect(VOICE).await.unwrap();
        h.player.add(song("a"), false);
        h.player.play().await.unwrap();

        h.log.finish(1);
        settle().await;
        assert_eq!(h.player.status(), PlayerStatus::Idle);
        assert!(h.log.calls().contains(&TransportCall::Stop(1)));

        advance_secs(29).await;
        assert!(h.player.is_connected());
        advance_secs(2).await;
        assert!(!h.player.is_connected());
        assert_eq!(h.log.calls().last(), Some(&TransportCall::Destroy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_song_cancels_idle_disconnect() {
        let h = harness_with(settings(30, false), MockAnnouncer::new());
        h.player.connect(VOICE).await.unwrap();
        h.player.add(song("a"), false);
        h.player.play().await.unwrap();
        h.log.finish(1);
        settle().await;

        advance_secs(10).await;
        h.player.add(song("b"), false);
        h.player.play().await.unwrap();

        advance_secs(40).await;
        assert!(h.player.is_connected());
        assert_eq!(h.player.status(), PlayerStatus::Playing);
    }

    #[tokio::test]
    async fn test_auto_announce_after_advance() {
        let mut announcer = MockAnnouncer::new();
        announcer
            .expect_now_playing()
            .withf(|channel, song, size| *channel == ChannelId::new(2) && song.title == "b" && *size == 0)
            .times(1)
            .return_const(());
        let h = harness_with(settings(0, true), announcer);
        h.player.connect(VOICE).await.unwrap();
        h.player.add(song("a"), false);
        h.player.add(song("b"), false);
        h.player.play().await.unwrap();

        h.log.finish(1);
        settle().await;
        assert_eq!(h.player.get_current().unwrap().title, "b");
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_clears_loops() {
        let h = connected_with(&["a"]).await;
        h.player.set_loop_current_song(true);
        h.player.set_loop_current_queue(true);
        h.player.play().await.unwrap();

        h.player.disconnect().await;
        h.player.disconnect().await;

        assert!(!h.player.is_connected());
        assert!(!h.player.loop_current_song());
        assert!(!h.player.loop_current_queue());
        assert_eq!(h.player.status(), PlayerStatus::Paused);
        let destroys = h.log.calls().iter().filter(|c| **c == TransportCall::Destroy).count();
        assert_eq!(destroys, 1);
    }

    #[tokio::test]
    async fn test_transport_disconnect_event_tears_down() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();

        h.log.drop_connection();
        settle().await;
        assert!(!h.player.is_connected());
        assert!(matches!(h.player.play().await, Err(PlayerError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_reconnect_seeks_to_last_position() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();
        advance_secs(7).await;
        h.player.disconnect().await;

        h.player.connect(VOICE).await.unwrap();
        h.player.play().await.unwrap();
        assert_eq!(h.player.status(), PlayerStatus::Playing);
        assert_eq!(h.player.get_position(), 7);
        let reopened = h.streams.opened();
        assert!(reopened.last().unwrap().input_options.windows(2).any(|w| w == ["-ss", "7"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_freezes_clock_when_pause_fails() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();
        advance_secs(5).await;

        *h.log.refuse_pause.lock() = true;
        h.player.disconnect().await;
        assert_eq!(h.player.status(), PlayerStatus::Paused);

        advance_secs(10).await;
        assert_eq!(h.player.get_position(), 5);

        h.player.connect(VOICE).await.unwrap();
        h.player.play().await.unwrap();
        let reopened = h.streams.opened();
        assert!(reopened.last().unwrap().input_options.windows(2).any(|w| w == ["-ss", "5"]));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_player_disconnected() {
        let h = harness();
        *h.log.refuse_connect.lock() = true;
        h.player.add(song("a"), false);

        assert!(matches!(h.player.connect(VOICE).await, Err(PlayerError::Transport(_))));
        assert!(!h.player.is_connected());
        assert!(matches!(h.player.play().await, Err(PlayerError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_seek_overflow_is_rejected() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();
        advance_secs(3).await;

        let err = h.player.forward_seek(u64::MAX).await.unwrap_err();
        assert!(matches!(err, PlayerError::SeekOutOfRange { .. }));
        assert_eq!(err.kind(), ErrorKind::UserInput);
        assert_eq!(h.player.get_position(), 3);
        assert_eq!(plays(&h.log), 1);

        h.player.forward_seek(10).await.unwrap();
        assert_eq!(h.player.get_position(), 13);
    }

    #[tokio::test]
    async fn test_concurrent_plays_leave_one_live_session() {
        let h = connected_with(&["a"]).await;
        let (first, second) = tokio::join!(h.player.play(), h.player.play());
        first.unwrap();
        second.unwrap();

        assert_eq!(plays(&h.log), 2);
        assert!(h.log.calls().contains(&TransportCall::Stop(1)));
        assert!(!h.log.calls().contains(&TransportCall::Stop(2)));
        assert_eq!(h.log.last_session(), Some(2));
        assert_eq!(h.player.status(), PlayerStatus::Playing);

        // Only the live session may advance the queue.
        h.log.finish(1);
        settle().await;
        assert_eq!(h.player.status(), PlayerStatus::Playing);
    }

    #[tokio::test]
    async fn test_seek_racing_play_supersedes_cleanly() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();

        let (seeked, played) = tokio::join!(h.player.seek(60), h.player.play());
        seeked.unwrap();
        played.unwrap();

        let stops = h.log.calls().iter().filter(|c| matches!(c, TransportCall::Stop(_))).count();
        assert_eq!(plays(&h.log), 3);
        assert_eq!(stops, 2);
        assert!(!h.log.calls().contains(&TransportCall::Stop(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_song_restart_resets_clock() {
        let h = connected_with(&["a"]).await;
        h.player.play().await.unwrap();
        advance_secs(9).await;

        h.player.play().await.unwrap();
        assert_eq!(h.player.get_position(), 0);
        assert_eq!(plays(&h.log), 2);
    }

    #[tokio::test]
    async fn test_stop_empties_queue() {
        let h = connected_with(&["a", "b", "c"]).await;
        h.player.play().await.unwrap();
        h.player.forward(1).await.unwrap();

        h.player.stop().await;
        assert_eq!(h.player.status(), PlayerStatus::Idle);
        assert!(h.player.get_current().is_none());
        assert_eq!(h.player.get_queue_position(), 0);
        assert!(!h.player.is_connected());
    }

    #[tokio::test]
    async fn test_volume_is_kept_across_resources() {
        let h = connected_with(&["a", "b"]).await;
        assert!(matches!(h.player.set_volume(101), Err(PlayerError::InvalidVolume(101))));

        h.player.set_volume(35).unwrap();
        h.player.play().await.unwrap();
        h.player.forward(1).await.unwrap();
        assert!(h.log.calls().contains(&TransportCall::Volume(2, 35)));

        h.player.reset_volume().unwrap();
        assert_eq!(h.player.get_volume(), 80);
        assert_eq!(h.log.calls().last(), Some(&TransportCall::Volume(2, 80)));
    }

    #[tokio::test]
    async fn test_clear_keeps_current_song() {
        let h = connected_with(&["a", "b", "c"]).await;
        h.player.play().await.unwrap();
        h.player.forward(1).await.unwrap();
        h.player.clear();

        assert_eq!(h.player.queue_size(), 0);
        assert_eq!(h.player.get_queue_position(), 0);
        assert_eq!(h.player.get_current().unwrap().title, "b");
    }
}
