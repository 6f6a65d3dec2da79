//! # Bot Module
//!
//! Gateway glue between Discord and the playback engine. Commands and
//! interactions live elsewhere; this handler only keeps players in step with
//! what Discord reports about the bot's own voice state.

use serenity::{
    all::{Context, EventHandler, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::manager::PlayerManager;

pub struct JukeboxBot {
    players: Arc<PlayerManager>,
}

impl JukeboxBot {
    pub fn new(players: Arc<PlayerManager>) -> Self {
        Self { players }
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());
    }

    /// Tears the player down when someone else kicks the bot out of voice.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        let Some(guild_id) = new.guild_id else { return };
        match self.players.existing(guild_id) {
            Some(player) if player.is_connected() => {
                info!("🔌 Bot was removed from voice in guild {}", guild_id);
                player.disconnect().await;
            }
            _ => debug!("Voice left in guild {} with no live player", guild_id),
        }
    }
}
