use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    events::CoreEvent,
    input::{AudioStream, Input, LiveInput},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use symphonia::core::probe::Hint;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::pipeline::PipelineStream;
use crate::error::{PlayerError, PlayerResult};

/// Signals from the voice layer, delivered to the owning player's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The resource of `session` stopped producing audio.
    TrackIdle { session: u64 },
    /// The voice connection went away.
    Disconnected,
}

pub type EventSink = mpsc::UnboundedSender<PlayerEvent>;

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: EventSink,
    ) -> PlayerResult<Box<dyn VoiceConnection>>;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Subscribes a new resource reading from `stream`, replacing whatever
    /// the connection was playing.
    async fn play(
        &self,
        stream: PipelineStream,
        session: u64,
        events: EventSink,
    ) -> PlayerResult<Box<dyn AudioResource>>;

    async fn destroy(&self);
}

/// A live, subscribed audio handle.
pub trait AudioResource: Send + Sync {
    fn pause(&self) -> PlayerResult<()>;

    /// Fails if the resource has already ended.
    fn resume(&self) -> PlayerResult<()>;

    fn stop(&self);

    /// `volume` is 0-100.
    fn set_volume(&self, volume: u8) -> PlayerResult<()>;
}

/// Voice transport backed by songbird.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: EventSink,
    ) -> PlayerResult<Box<dyn VoiceConnection>> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| PlayerError::Transport(format!("Error joining voice channel: {e}")))?;

        {
            let mut handler = call.lock().await;
            // A rejoin reuses the Call, so handlers from the previous connection must go.
            handler.remove_all_global_events();
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectHandler { guild_id, events },
            );
        }

        info!("🔊 Connected to voice channel {} in guild {}", channel_id, guild_id);

        Ok(Box::new(SongbirdConnection {
            manager: self.manager.clone(),
            guild_id,
            call,
        }))
    }
}

pub struct SongbirdConnection {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    call: Arc<Mutex<Call>>,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    async fn play(
        &self,
        stream: PipelineStream,
        session: u64,
        events: EventSink,
    ) -> PlayerResult<Box<dyn AudioResource>> {
        let mut hint = Hint::new();
        hint.with_extension("webm");
        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: Box::new(stream),
                hint: Some(hint),
            }),
            None,
        );

        let handle = self.call.lock().await.play_only_input(input);

        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackIdleHandler {
                        guild_id: self.guild_id,
                        session,
                        events: events.clone(),
                    },
                )
                .map_err(|e| PlayerError::Transport(format!("Error adding track event handler: {e}")))?;
        }

        Ok(Box::new(SongbirdResource { handle }))
    }

    async fn destroy(&self) {
        self.call.lock().await.remove_all_global_events();
        if let Err(e) = self.manager.remove(self.guild_id).await {
            debug!("Voice connection for guild {} already gone: {}", self.guild_id, e);
        }
        info!("👋 Left voice channel in guild {}", self.guild_id);
    }
}

pub struct SongbirdResource {
    handle: TrackHandle,
}

impl AudioResource for SongbirdResource {
    fn pause(&self) -> PlayerResult<()> {
        self.handle
            .pause()
            .map_err(|e| PlayerError::Transport(format!("Error pausing track: {e}")))
    }

    fn resume(&self) -> PlayerResult<()> {
        self.handle
            .play()
            .map_err(|e| PlayerError::Transport(format!("Error resuming track: {e}")))
    }

    fn stop(&self) {
        if let Err(e) = self.handle.stop() {
            debug!("Track already stopped: {}", e);
        }
    }

    fn set_volume(&self, volume: u8) -> PlayerResult<()> {
        self.handle
            .set_volume(f32::from(volume.min(100)) / 100.0)
            .map_err(|e| PlayerError::Transport(format!("Error setting volume: {e}")))
    }
}

/// Forwards the end of a track to the player.
struct TrackIdleHandler {
    guild_id: GuildId,
    session: u64,
    events: EventSink,
}

#[async_trait]
impl VoiceEventHandler for TrackIdleHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(track_list) = ctx {
            for (state, _handle) in *track_list {
                if let songbird::tracks::PlayMode::Errored(e) = &state.playing {
                    error!("❌ Track error in guild {}: {:?}", self.guild_id, e);
                }
            }
        }

        debug!("Session {} idle in guild {}", self.session, self.guild_id);
        let _ = self.events.send(PlayerEvent::TrackIdle { session: self.session });
        // Only fire once per resource.
        Some(Event::Cancel)
    }
}

struct DisconnectHandler {
    guild_id: GuildId,
    events: EventSink,
}

#[async_trait]
impl VoiceEventHandler for DisconnectHandler {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        warn!("🔌 Voice driver disconnected in guild {}", self.guild_id);
        let _ = self.events.send(PlayerEvent::Disconnected);
        None
    }
}
