pub mod formats;
pub mod soundcloud;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serenity::model::id::{ChannelId, UserId};
use std::ops::Deref;

pub use formats::{FormatResolver, FormatProbe, YtDlpProbe};
pub use soundcloud::{TrackStreamer, YtDlpTrackStreamer};

/// Turns a user query into playable song descriptions. Implemented by the
/// search front ends that build queued songs.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Resolves a query or URL. Individual items may be dropped without failing the batch.
    async fn resolve(&self, query: &str) -> Result<Vec<SongMetadata>>;

    /// Whether this resolver understands the query at all.
    fn handles(&self, query: &str) -> bool;
}

/// Where a song's audio comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaSource {
    YouTube,
    SoundCloud,
    Hls,
    Cache,
}

impl MediaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaSource::YouTube => "YouTube",
            MediaSource::SoundCloud => "SoundCloud",
            MediaSource::Hls => "HLS",
            MediaSource::Cache => "Cache",
        }
    }
}

/// Playlist a song was queued from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedPlaylist {
    pub title: String,
    pub source: String,
}

/// Immutable description of a playable item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SongMetadata {
    pub title: String,
    pub artist: String,
    /// Source specific locator: watch URL, HLS URL or cache key.
    pub url: String,
    /// Length in seconds, 0 when unknown.
    pub length: u64,
    /// Seconds into the source where this song starts (chapter splits).
    pub offset: u64,
    pub is_live: bool,
    pub thumbnail_url: Option<String>,
    pub source: MediaSource,
    pub playlist: Option<QueuedPlaylist>,
}

impl SongMetadata {
    pub fn new(title: impl Into<String>, url: impl Into<String>, source: MediaSource) -> Self {
        Self {
            title: title.into(),
            artist: String::from("Unknown Artist"),
            url: url.into(),
            length: 0,
            offset: 0,
            is_live: false,
            thumbnail_url: None,
            source,
            playlist: None,
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = length;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail_url = Some(thumbnail.into());
        self
    }

    pub fn with_playlist(mut self, playlist: QueuedPlaylist) -> Self {
        self.playlist = Some(playlist);
        self
    }
}

/// A song plus who asked for it and where.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedSong {
    #[serde(flatten)]
    pub metadata: SongMetadata,
    pub requested_by: UserId,
    pub requested_by_name: String,
    pub added_in_channel_id: ChannelId,
    pub added_at: DateTime<Utc>,
}

impl QueuedSong {
    pub fn new(
        metadata: SongMetadata,
        requested_by: UserId,
        requested_by_name: impl Into<String>,
        added_in_channel_id: ChannelId,
    ) -> Self {
        Self {
            metadata,
            requested_by,
            requested_by_name: requested_by_name.into(),
            added_in_channel_id,
            added_at: Utc::now(),
        }
    }
}

impl Deref for QueuedSong {
    type Target = SongMetadata;

    fn deref(&self) -> &SongMetadata {
        &self.metadata
    }
}
