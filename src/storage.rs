use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use crate::config::Config;

/// Per-guild playback preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSettings {
    pub guild_id: u64,
    /// 0-100, used whenever no explicit volume has been set.
    pub default_volume: u8,
    /// Grace period before leaving voice once the queue runs out, 0 disables it.
    pub seconds_to_wait_after_queue_empties: u64,
    pub auto_announce_next_song: bool,
}

impl GuildSettings {
    pub fn from_config(guild_id: u64, config: &Config) -> Self {
        Self {
            guild_id,
            default_volume: config.default_volume,
            seconds_to_wait_after_queue_empties: config.seconds_to_wait_after_queue_empties,
            auto_announce_next_song: config.auto_announce_next_song,
        }
    }
}

/// Source of per-guild settings for the players.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuildSettingsProvider: Send + Sync {
    async fn get(&self, guild_id: GuildId) -> GuildSettings;
}

/// Guild settings stored as one JSON file per guild.
pub struct JsonStorage {
    data_dir: PathBuf,
    defaults: Config,
    guilds: DashMap<u64, GuildSettings>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf, defaults: Config) -> Result<Self> {
        fs::create_dir_all(data_dir.join("guilds")).await?;
        info!("📁 Storage initialized at: {}", data_dir.display());

        let storage = Self {
            data_dir,
            defaults,
            guilds: DashMap::new(),
        };
        storage.load_all_guilds().await?;

        Ok(storage)
    }

    pub async fn get_guild_settings(&self, guild_id: u64) -> GuildSettings {
        if let Some(settings) = self.guilds.get(&guild_id) {
            return settings.clone();
        }

        let settings = match self.load_guild_settings(guild_id).await {
            Ok(settings) => settings,
            Err(_) => GuildSettings::from_config(guild_id, &self.defaults),
        };
        self.guilds.insert(guild_id, settings.clone());
        settings
    }

    pub async fn update_guild_settings(&self, settings: GuildSettings) -> Result<()> {
        let path = self.guild_file_path(settings.guild_id);
        let content = serde_json::to_string_pretty(&settings)?;
        fs::write(&path, content).await?;

        info!("💾 Settings updated for guild {}", settings.guild_id);
        self.guilds.insert(settings.guild_id, settings);
        Ok(())
    }

    pub async fn set_default_volume(&self, guild_id: u64, volume: u8) -> Result<()> {
        let mut settings = self.get_guild_settings(guild_id).await;
        settings.default_volume = volume.min(100);
        self.update_guild_settings(settings).await
    }

    pub fn list_guilds(&self) -> Vec<u64> {
        self.guilds.iter().map(|entry| *entry.key()).collect()
    }

    async fn load_guild_settings(&self, guild_id: u64) -> Result<GuildSettings> {
        let content = fs::read_to_string(self.guild_file_path(guild_id)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn load_all_guilds(&self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("guilds")).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let guild_id = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok());

            if let Some(guild_id) = guild_id {
                match self.load_guild_settings(guild_id).await {
                    Ok(settings) => {
                        self.guilds.insert(guild_id, settings);
                        loaded_count += 1;
                    }
                    Err(e) => warn!("Error loading settings for guild {}: {}", guild_id, e),
                }
            }
        }

        if loaded_count > 0 {
            info!("📂 Loaded settings for {} guild(s)", loaded_count);
        }

        Ok(())
    }

    fn guild_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join("guilds").join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl GuildSettingsProvider for JsonStorage {
    async fn get(&self, guild_id: GuildId) -> GuildSettings {
        self.get_guild_settings(guild_id.get()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_missing_guild_gets_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = Config { default_volume: 70, ..Config::default() };
        let storage = JsonStorage::new(dir.path().to_path_buf(), defaults).await.unwrap();

        let settings = storage.get(GuildId::new(42)).await;
        assert_eq!(settings, GuildSettings {
            guild_id: 42,
            default_volume: 70,
            seconds_to_wait_after_queue_empties: 30,
            auto_announce_next_song: false,
        });
    }

    #[tokio::test]
    async fn test_updates_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path().to_path_buf(), Config::default()).await.unwrap();
        storage.set_default_volume(7, 250).await.unwrap();

        let reloaded = JsonStorage::new(dir.path().to_path_buf(), Config::default()).await.unwrap();
        assert_eq!(reloaded.list_guilds(), vec![7]);
        assert_eq!(reloaded.get(GuildId::new(7)).await.default_volume, 100);
    }
}
