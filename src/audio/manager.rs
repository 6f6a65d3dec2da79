use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::debug;

use super::player::{Player, PlayerServices};

/// One [`Player`] per guild, created on first use and kept for the life of the process.
pub struct PlayerManager {
    players: DashMap<GuildId, Arc<Player>>,
    services: PlayerServices,
}

impl PlayerManager {
    pub fn new(services: PlayerServices) -> Self {
        Self {
            players: DashMap::new(),
            services,
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Arc<Player> {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                debug!("Creating player for guild {}", guild_id);
                Player::new(guild_id, self.services.clone())
            })
            .clone()
    }

    /// The player for `guild_id` if one was ever created.
    pub fn existing(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|player| player.clone())
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::player::test_support::inert_services;

    fn manager() -> PlayerManager {
        PlayerManager::new(inert_services())
    }

    #[tokio::test]
    async fn test_one_player_per_guild() {
        let manager = manager();
        assert!(manager.existing(GuildId::new(1)).is_none());

        let first = manager.get(GuildId::new(1));
        let again = manager.get(GuildId::new(1));
        let other = manager.get(GuildId::new(2));

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(other.guild_id(), GuildId::new(2));
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_state_survives_lookups() {
        let manager = manager();
        manager
            .get(GuildId::new(5))
            .add(crate::sources::test_support::song("kept"), false);

        assert_eq!(manager.get(GuildId::new(5)).get_current().unwrap().title, "kept");
    }
}
