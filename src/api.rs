//! Read-only HTTP status surface.
//!
//! `GET /np/:guild_id` returns what a guild's player is doing. Everything in
//! the payload is derived from the player at request time.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::info;

use crate::{
    audio::{
        manager::PlayerManager,
        player::{Player, PlayerStatus},
    },
    sources::{MediaSource, QueuedSong},
    ui::embeds::format_duration,
};

const SLICE_LEN: usize = 50;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SongTitleInfo {
    pub title: String,
    pub url: String,
    pub youtube_id: Option<String>,
    pub source: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SongView {
    #[serde(flatten)]
    pub song: QueuedSong,
    pub info: SongTitleInfo,
    pub length_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    #[serde(flatten)]
    pub song: SongView,
    pub position: u64,
    pub elapsed_time_text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub length: u64,
    pub length_text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub success: bool,
    pub np: Option<NowPlaying>,
    pub queue: Vec<SongView>,
    pub history: Vec<SongView>,
    pub looping: bool,
    pub status: PlayerStatus,
    pub status_text: &'static str,
    pub stats: QueueStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Video id from a watch URL, a short link or a bare id.
fn youtube_id(locator: &str) -> Option<String> {
    if locator.len() == 11 && !locator.contains('/') {
        return Some(locator.to_string());
    }

    let url = url::Url::parse(locator).ok()?;
    match url.host_str()? {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        _ => url.query_pairs().find(|(k, _)| k == "v").map(|(_, v)| v.into_owned()),
    }
}

fn title_info(song: &QueuedSong) -> SongTitleInfo {
    match song.source {
        MediaSource::Hls => SongTitleInfo {
            title: song.title.clone(),
            url: song.url.clone(),
            youtube_id: None,
            source: "HLS",
        },
        MediaSource::SoundCloud => SongTitleInfo {
            title: song.title.clone(),
            url: song.url.clone(),
            youtube_id: None,
            source: "SoundCloud",
        },
        MediaSource::Cache => SongTitleInfo {
            title: song.title.clone(),
            url: String::new(),
            youtube_id: None,
            source: "Cache",
        },
        MediaSource::YouTube => {
            let id = youtube_id(&song.url).unwrap_or_default();
            let offset = if song.offset == 0 {
                String::new()
            } else {
                format!("&t={}", song.offset)
            };
            // Drop bracketed tags like "[Official Video]".
            let title = match (song.title.find('['), song.title.rfind(']')) {
                (Some(start), Some(end)) if start < end => {
                    format!("{}{}", &song.title[..start], &song.title[end + 1..])
                }
                _ => song.title.clone(),
            };

            SongTitleInfo {
                title: title.trim().to_string(),
                url: format!("https://www.youtube.com/watch?v={id}{offset}"),
                youtube_id: Some(id),
                source: "YouTube",
            }
        }
    }
}

fn length_text(song: &QueuedSong) -> String {
    if song.is_live {
        "live".to_string()
    } else {
        format_duration(song.length)
    }
}

fn song_view(song: QueuedSong, index: Option<usize>) -> SongView {
    SongView {
        info: title_info(&song),
        length_text: length_text(&song),
        song,
        index,
    }
}

impl StatusPayload {
    /// What a guild that never had a player looks like.
    pub fn empty() -> Self {
        Self {
            success: true,
            np: None,
            queue: Vec::new(),
            history: Vec::new(),
            looping: false,
            status: PlayerStatus::Idle,
            status_text: "Paused",
            stats: QueueStats {
                size: 0,
                length: 0,
                length_text: format_duration(0),
            },
        }
    }

    pub fn from_player(player: &Player) -> Self {
        let position = player.get_queue_position();
        let elapsed = player.get_position();
        let status = player.status();

        let queue = player
            .get_queue()
            .into_iter()
            .take(SLICE_LEN)
            .enumerate()
            .map(|(i, song)| song_view(song, Some(position + i + 1)))
            .collect();

        let history = player
            .get_queue_history()
            .into_iter()
            .rev()
            .take(SLICE_LEN)
            .enumerate()
            .map(|(i, song)| song_view(song, Some(position - i - 1)))
            .collect();

        let np = player.get_current().map(|song| {
            let elapsed_time_text = if song.is_live {
                "live".to_string()
            } else {
                format!("{}/{}", format_duration(elapsed), format_duration(song.length))
            };
            NowPlaying {
                song: song_view(song, Some(position)),
                position: elapsed,
                elapsed_time_text,
            }
        });

        let length = player.queue_length();
        Self {
            success: true,
            np,
            queue,
            history,
            looping: player.loop_current_song(),
            status,
            status_text: if status == PlayerStatus::Playing { "Now Playing" } else { "Paused" },
            stats: QueueStats {
                size: player.queue_size(),
                length,
                length_text: format_duration(length),
            },
        }
    }
}

async fn now_playing(
    State(players): State<Arc<PlayerManager>>,
    Path(guild_id): Path<u64>,
) -> Result<Json<StatusPayload>, (StatusCode, Json<ErrorResponse>)> {
    if guild_id == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                success: false,
                error: "Invalid guild id".to_string(),
            }),
        ));
    }

    let payload = match players.existing(GuildId::new(guild_id)) {
        Some(player) => StatusPayload::from_player(&player),
        None => StatusPayload::empty(),
    };
    Ok(Json(payload))
}

pub fn router(players: Arc<PlayerManager>) -> Router {
    Router::new()
        .route("/np/:guild_id", get(now_playing))
        .with_state(players)
}

pub async fn serve(port: u16, players: Arc<PlayerManager>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("⚡️ Status API listening on http://localhost:{}", port);
    axum::serve(listener, router(players)).await?;
    Ok(())
}
