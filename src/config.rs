use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // External binaries
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub http_proxy: Option<String>,

    // Pipeline
    pub cache_duration_limit_seconds: u64,
    pub reconnect_delay_max_seconds: u64,

    // Status API
    pub webserver_port: u16,

    // Per-guild defaults
    pub default_volume: u8,
    pub seconds_to_wait_after_queue_empties: u64,
    pub auto_announce_next_song: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let data_dir: PathBuf = env_or("DATA_DIR", "./data").into();
        let cache_dir = match std::env::var("CACHE_DIR") {
            Ok(dir) if !dir.trim().is_empty() => dir.into(),
            _ => data_dir.join("cache"),
        };

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN")?,

            data_dir,
            cache_dir,

            ytdlp_path: env_or("YTDLP_PATH", "yt-dlp"),
            ffmpeg_path: env_or("FFMPEG_PATH", "ffmpeg"),
            http_proxy: std::env::var("HTTP_PROXY").ok().filter(|p| !p.trim().is_empty()),

            cache_duration_limit_seconds: env_or("CACHE_DURATION_LIMIT_SECONDS", "1800").parse()?,
            reconnect_delay_max_seconds: env_or("RECONNECT_DELAY_MAX_SECONDS", "5").parse()?,

            webserver_port: env_or("WEBSERVER_PORT", "3000").parse()?,

            default_volume: env_or("DEFAULT_VOLUME", "100").parse()?,
            seconds_to_wait_after_queue_empties: env_or("SECONDS_TO_WAIT_AFTER_QUEUE_EMPTIES", "30")
                .parse()?,
            auto_announce_next_song: env_or("AUTO_ANNOUNCE_NEXT_SONG", "false").parse()?,
        };

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Sanity checks on values that parse fine but make no sense.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 100 {
            anyhow::bail!("Default volume must be between 0 and 100, got: {}", self.default_volume);
        }

        if self.cache_duration_limit_seconds == 0 {
            anyhow::bail!("Cache duration limit must be greater than 0");
        }

        if self.reconnect_delay_max_seconds == 0 {
            anyhow::bail!("Reconnect delay must be greater than 0");
        }

        if let Some(proxy) = &self.http_proxy {
            url::Url::parse(proxy).map_err(|e| anyhow::anyhow!("Invalid HTTP_PROXY {proxy}: {e}"))?;
        }

        Ok(())
    }

    /// Pipeline knobs handed to every player.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            ffmpeg_path: self.ffmpeg_path.clone(),
            http_proxy: self.http_proxy.clone(),
            cache_duration_limit_seconds: self.cache_duration_limit_seconds,
            reconnect_delay_max_seconds: self.reconnect_delay_max_seconds,
        }
    }

    /// Loggable summary without the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Paths: data={} cache={}\n  \
            Binaries: yt-dlp={} ffmpeg={} proxy={}\n  \
            Pipeline: cache up to {}s, reconnect delay {}s\n  \
            Guild defaults: {}% vol, idle disconnect {}s, announce={}\n  \
            Status API: port {}",
            self.data_dir.display(),
            self.cache_dir.display(),
            self.ytdlp_path,
            self.ffmpeg_path,
            self.http_proxy.as_deref().unwrap_or("none"),
            self.cache_duration_limit_seconds,
            self.reconnect_delay_max_seconds,
            self.default_volume,
            self.seconds_to_wait_after_queue_empties,
            self.auto_announce_next_song,
            self.webserver_port,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),

            data_dir: "./data".into(),
            cache_dir: "./data/cache".into(),

            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            http_proxy: None,

            cache_duration_limit_seconds: 30 * 60,
            reconnect_delay_max_seconds: 5,

            webserver_port: 3000,

            default_volume: 100,
            seconds_to_wait_after_queue_empties: 30,
            auto_announce_next_song: false,
        }
    }
}

/// Settings for format resolution and the transcoding pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub ffmpeg_path: String,
    pub http_proxy: Option<String>,
    /// Songs at least this long are streamed without caching.
    pub cache_duration_limit_seconds: u64,
    pub reconnect_delay_max_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Config::default().pipeline()
    }
}
