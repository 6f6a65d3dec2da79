use async_trait::async_trait;
use serenity::{
    all::{ChannelId, Timestamp},
    builder::{CreateEmbed, CreateEmbedFooter, CreateMessage},
    http::Http,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    audio::player::Announcer,
    sources::{MediaSource, QueuedSong},
};

/// Standard colour palette.
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
}

const STANDARD_FOOTER: &str = "🎵 Guild Jukebox";

/// `m:ss`, or `h:mm:ss` from one hour up.
pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

pub fn length_text(song: &QueuedSong) -> String {
    if song.is_live {
        "🔴 Live".to_string()
    } else {
        format_duration(song.length)
    }
}

pub fn create_now_playing_embed(song: &QueuedSong, queue_size: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("🎵 Now Playing")
        .description(format!("**{}**", song.title))
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Artist", &song.artist, true)
        .field("⏱️ Length", length_text(song), true)
        .field("👤 Requested by", format!("<@{}>", song.requested_by), true)
        .field("🔗 Source", song.source.as_str(), true);

    if let Some(playlist) = &song.playlist {
        embed = embed.field("📋 Playlist", &playlist.title, true);
    }

    if queue_size > 0 {
        embed = embed.field("📊 Up next", format!("{} song(s)", queue_size), true);
    }

    if let Some(thumbnail) = &song.thumbnail_url {
        embed = embed.thumbnail(thumbnail);
    }

    if song.source != MediaSource::Cache {
        embed = embed.url(&song.url);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Posts now-playing embeds to the channel a song was queued from.
pub struct EmbedAnnouncer {
    http: Arc<Http>,
}

impl EmbedAnnouncer {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Announcer for EmbedAnnouncer {
    async fn now_playing(&self, channel_id: ChannelId, song: &QueuedSong, queue_size: usize) {
        let message = CreateMessage::new().embed(create_now_playing_embed(song, queue_size));

        match channel_id.send_message(&self.http, message).await {
            Ok(_) => debug!("📢 Announced {} in {}", song.title, channel_id),
            Err(e) => warn!("Could not announce next song in {}: {}", channel_id, e),
        }
    }
}
