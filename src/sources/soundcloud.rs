use async_trait::async_trait;
use std::{
    io,
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, ReadBuf},
    process::{Child, ChildStdout, Command},
};
use tracing::debug;

use super::formats::BoxedReader;
use crate::error::{PlayerError, PlayerResult};

/// Opens the audio of a SoundCloud track as a byte stream.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackStreamer: Send + Sync {
    async fn stream_track(&self, url: &str) -> PlayerResult<BoxedReader>;
}

/// Streams tracks through `yt-dlp -o -`.
pub struct YtDlpTrackStreamer {
    path: String,
}

impl YtDlpTrackStreamer {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// yt-dlp's stdout, keeping the process alive for as long as it is read.
struct ChildOutput {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ChildOutput {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

#[async_trait]
impl TrackStreamer for YtDlpTrackStreamer {
    async fn stream_track(&self, url: &str) -> PlayerResult<BoxedReader> {
        debug!("☁️ Opening SoundCloud stream: {}", url);

        let mut child = Command::new(&self.path)
            .args(["-f", "bestaudio", "--no-playlist", "--no-warnings", "--quiet", "-o", "-", url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlayerError::Probe(format!("Failed to spawn yt-dlp: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlayerError::Probe("yt-dlp stdout unavailable".to_string()))?;

        Ok(Box::new(ChildOutput { _child: child, stdout }))
    }
}
