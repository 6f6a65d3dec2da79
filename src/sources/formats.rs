use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::{fmt, path::PathBuf, sync::Arc};
use tokio::{io::AsyncRead, process::Command};
use tracing::{debug, info, warn};

use super::{soundcloud::TrackStreamer, MediaSource, QueuedSong};
use crate::{
    cache::{cache_key, ContentCache},
    config::PipelineConfig,
    error::{PlayerError, PlayerResult},
};

/// Encoding we can pass through without any real work.
const IDEAL_CODEC: &str = "opus";
const IDEAL_CONTAINER: &str = "webm";
const IDEAL_SAMPLE_RATE: u32 = 48_000;

/// Audio-capable itags served for live streams.
const LIVE_ITAGS: [&str; 7] = ["128", "127", "120", "96", "95", "94", "93"];

/// One encoding offered by a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioFormat {
    pub url: String,
    pub itag: String,
    pub codec: Option<String>,
    pub container: Option<String>,
    pub sample_rate: Option<u32>,
    /// Average audio bitrate (kbps).
    pub average_bitrate: Option<f64>,
    /// Generic total bitrate (kbps), present on muxed audio+video formats.
    pub bitrate: Option<f64>,
}

impl AudioFormat {
    fn is_ideal(&self) -> bool {
        self.codec.as_deref() == Some(IDEAL_CODEC)
            && self.container.as_deref() == Some(IDEAL_CONTAINER)
            && self.sample_rate == Some(IDEAL_SAMPLE_RATE)
    }
}

/// What a probe learned about a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub formats: Vec<AudioFormat>,
    pub is_live: bool,
    pub length: u64,
}

#[derive(Debug, Deserialize)]
struct YtDlpResponse {
    formats: Option<Vec<YtDlpFormat>>,
    is_live: Option<bool>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    url: Option<String>,
    format_id: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    ext: Option<String>,
    asr: Option<f64>,
    abr: Option<f64>,
    tbr: Option<f64>,
}

impl ProbeInfo {
    /// Parses the output of `yt-dlp --dump-json`.
    pub fn from_ytdlp_json(json: &str) -> PlayerResult<Self> {
        let info: YtDlpResponse = serde_json::from_str(json)
            .map_err(|e| PlayerError::Probe(format!("Failed to parse yt-dlp JSON output: {e}")))?;

        let formats = info
            .formats
            .unwrap_or_default()
            .into_iter()
            .map(|f| AudioFormat {
                url: f.url.unwrap_or_default(),
                itag: f.format_id.unwrap_or_default(),
                codec: match f.acodec {
                    Some(acodec) if acodec != "none" => Some(acodec),
                    _ => f.vcodec,
                },
                container: f.ext,
                sample_rate: f.asr.map(|asr| asr as u32),
                average_bitrate: f.abr,
                bitrate: f.tbr,
            })
            .collect();

        Ok(Self {
            formats,
            is_live: info.is_live.unwrap_or(false),
            length: info.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
        })
    }
}

/// Lists the encodings available for a source URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FormatProbe: Send + Sync {
    async fn probe(&self, url: &str) -> PlayerResult<ProbeInfo>;
}

/// Probes through the `yt-dlp` binary.
pub struct YtDlpProbe {
    path: String,
}

impl YtDlpProbe {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Maps a failed yt-dlp run to an error, spotting sources that are gone for good.
fn classify_ytdlp_failure(code: Option<i32>, stderr: &str) -> PlayerError {
    let lower = stderr.to_lowercase();
    if lower.contains("http error 410")
        || lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("has been removed")
    {
        PlayerError::SourceGone(stderr.trim().to_string())
    } else {
        PlayerError::Probe(format!("yt-dlp failed with code {code:?}: {}", stderr.trim()))
    }
}

#[async_trait]
impl FormatProbe for YtDlpProbe {
    async fn probe(&self, url: &str) -> PlayerResult<ProbeInfo> {
        debug!("📊 Probing formats for: {}", url);

        let output = Command::new(&self.path)
            .args(["--dump-json", "--no-warnings", "--no-playlist", url])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PlayerError::Probe(format!("Failed to spawn yt-dlp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ytdlp_failure(output.status.code(), &stderr));
        }

        ProbeInfo::from_ytdlp_json(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Picks the encoding to stream.
///
/// Order of preference:
/// 1. the ideal profile (opus in webm at 48 kHz), wherever it sits in the list;
/// 2. for live streams, the allow-listed itag with the highest audio bitrate;
/// 3. among formats with an average bitrate, sorted highest first, the first one
///    without a generic bitrate, else the highest;
/// 4. with no average bitrates at all, the first format without a generic
///    bitrate, else the first format.
pub fn select_format(formats: &[AudioFormat], is_live: bool) -> Option<&AudioFormat> {
    let playable: Vec<&AudioFormat> = formats.iter().filter(|f| !f.url.is_empty()).collect();

    if let Some(ideal) = playable.iter().find(|f| f.is_ideal()) {
        return Some(*ideal);
    }

    if is_live {
        let best_live = playable
            .iter()
            .copied()
            .filter(|f| LIVE_ITAGS.contains(&f.itag.as_str()))
            .fold(None::<&AudioFormat>, |best, f| match best {
                Some(b) if b.average_bitrate.unwrap_or(0.0) >= f.average_bitrate.unwrap_or(0.0) => Some(b),
                _ => Some(f),
            });
        if best_live.is_some() {
            return best_live;
        }
    }

    let mut by_average: Vec<&AudioFormat> = playable
        .iter()
        .copied()
        .filter(|f| f.average_bitrate.is_some())
        .collect();
    by_average.sort_by(|a, b| {
        b.average_bitrate
            .partial_cmp(&a.average_bitrate)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let pool = if by_average.is_empty() { playable } else { by_average };
    pool.iter().find(|f| f.bitrate.is_none()).or(pool.first()).copied()
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// An already-open byte stream, handed to the transcoder on stdin.
///
/// Clones share the stream; whoever calls [`ByteSource::take`] first gets it.
#[derive(Clone)]
pub struct ByteSource {
    label: String,
    reader: Arc<Mutex<Option<BoxedReader>>>,
}

impl ByteSource {
    pub fn new(label: impl Into<String>, reader: BoxedReader) -> Self {
        Self {
            label: label.into(),
            reader: Arc::new(Mutex::new(Some(reader))),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take(&self) -> Option<BoxedReader> {
        self.reader.lock().take()
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ByteSource").field(&self.label).finish()
    }
}

impl PartialEq for ByteSource {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
    }
}

/// Where the transcoder reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Url(String),
    File(PathBuf),
    Reader(ByteSource),
}

impl InputSource {
    pub fn as_arg(&self) -> String {
        match self {
            InputSource::Url(url) => url.clone(),
            InputSource::File(path) => path.to_string_lossy().into_owned(),
            InputSource::Reader(_) => "pipe:0".to_string(),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, InputSource::Url(_))
    }
}

/// Start and end bounds (in source seconds) for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekOptions {
    pub seek: Option<u64>,
    pub to: Option<u64>,
}

impl SeekOptions {
    pub fn is_seeking(&self) -> bool {
        self.seek.unwrap_or(0) > 0
    }

    fn push_args(&self, args: &mut Vec<String>) {
        if let Some(seek) = self.seek.filter(|s| *s > 0) {
            args.extend(["-ss".to_string(), seek.to_string()]);
        }
        if let Some(to) = self.to.filter(|t| *t > 0) {
            args.extend(["-to".to_string(), to.to_string()]);
        }
    }
}

/// Everything the pipeline needs to start transcoding a song.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInput {
    pub source: InputSource,
    /// Arguments placed before `-i`.
    pub input_options: Vec<String>,
    /// Set when the output should be mirrored into the content cache.
    pub cache_key: Option<String>,
    pub proxy: Option<String>,
}

/// Full watch URL for a YouTube locator that may be a bare video id.
pub fn canonical_youtube_url(locator: &str) -> String {
    match url::Url::parse(locator) {
        Ok(url) => url.to_string(),
        Err(_) => format!("https://www.youtube.com/watch?v={}", locator.trim()),
    }
}

/// Resolves queued songs to transcoder inputs.
pub struct FormatResolver {
    cache: Arc<dyn ContentCache>,
    probe: Arc<dyn FormatProbe>,
    tracks: Option<Arc<dyn TrackStreamer>>,
    config: Arc<PipelineConfig>,
}

impl FormatResolver {
    pub fn new(cache: Arc<dyn ContentCache>, probe: Arc<dyn FormatProbe>, config: Arc<PipelineConfig>) -> Self {
        Self {
            cache,
            probe,
            tracks: None,
            config,
        }
    }

    /// Enables SoundCloud songs, which are read from an open stream.
    pub fn with_track_streamer(mut self, tracks: Arc<dyn TrackStreamer>) -> Self {
        self.tracks = Some(tracks);
        self
    }

    pub async fn resolve(&self, song: &QueuedSong, options: SeekOptions) -> PlayerResult<StreamInput> {
        let mut input_options = Vec::new();

        let input = match song.source {
            MediaSource::SoundCloud => {
                let tracks = self.tracks.as_ref().ok_or(PlayerError::NoSuitableFormat)?;
                let reader = tracks.stream_track(&song.url).await?;
                input_options.push("-re".to_string());
                options.push_args(&mut input_options);
                return Ok(StreamInput {
                    source: InputSource::Reader(ByteSource::new(song.url.clone(), reader)),
                    input_options,
                    cache_key: None,
                    proxy: None,
                });
            }
            MediaSource::Hls => {
                input_options.push("-re".to_string());
                options.push_args(&mut input_options);
                return Ok(StreamInput {
                    source: InputSource::Url(song.url.clone()),
                    input_options,
                    cache_key: None,
                    proxy: self.config.http_proxy.clone(),
                });
            }
            MediaSource::Cache => {
                let path = self
                    .cache
                    .path_for(&song.url)
                    .await
                    .ok_or_else(|| PlayerError::CacheMiss(song.url.clone()))?;
                options.push_args(&mut input_options);
                StreamInput {
                    source: InputSource::File(path),
                    input_options,
                    cache_key: None,
                    proxy: None,
                }
            }
            MediaSource::YouTube => {
                let url = canonical_youtube_url(&song.url);
                let key = cache_key(&url);

                if let Some(path) = self.cache.path_for(&key).await {
                    debug!("💾 Cache hit for {}", song.title);
                    options.push_args(&mut input_options);
                    StreamInput {
                        source: InputSource::File(path),
                        input_options,
                        cache_key: None,
                        proxy: None,
                    }
                } else {
                    self.resolve_remote(song, &url, key, options).await?
                }
            }
        };

        Ok(input)
    }

    async fn resolve_remote(
        &self,
        song: &QueuedSong,
        url: &str,
        key: String,
        options: SeekOptions,
    ) -> PlayerResult<StreamInput> {
        let info = self.probe.probe(url).await?;

        let format = match select_format(&info.formats, info.is_live) {
            Some(format) => format,
            None => {
                warn!("No suitable format among {} for {}", info.formats.len(), song.title);
                return Err(PlayerError::NoSuitableFormat);
            }
        };
        debug!("Using format {} ({:?}/{:?})", format.itag, format.codec, format.container);

        let should_cache = !info.is_live
            && info.length < self.config.cache_duration_limit_seconds
            && !options.is_seeking();
        info!(
            "{} {}",
            if should_cache { "💾 Caching" } else { "🌐 Streaming without cache:" },
            song.title
        );

        let mut input_options = vec![
            "-reconnect".to_string(),
            "1".to_string(),
            "-reconnect_streamed".to_string(),
            "1".to_string(),
            "-reconnect_delay_max".to_string(),
            self.config.reconnect_delay_max_seconds.to_string(),
        ];
        options.push_args(&mut input_options);

        Ok(StreamInput {
            source: InputSource::Url(format.url.clone()),
            input_options,
            cache_key: should_cache.then_some(key),
            proxy: self.config.http_proxy.clone(),
        })
    }
}
