//! Transcoding pipeline.
//!
//! Every session runs one ffmpeg process that turns the resolved input into
//! opus-in-webm on stdout. A relay task reads that output and forwards it
//! over a bounded channel to a [`PipelineStream`], the blocking reader handed
//! to the voice driver. When the resolver decided to cache, the relay mirrors
//! every chunk into a [`CacheWriter`] as well.
//!
//! ```text
//! ffmpeg stdout ──► relay task ──► flume (bounded) ──► PipelineStream ──► songbird
//!                       │
//!                       └──► CacheWriter ──► <cache>/<key>
//! ```
//!
//! Once a cached relay has started, it always runs to ffmpeg's EOF, even after the
//! listener goes away, so the entry it commits is the complete song. A relay
//! that isn't caching kills ffmpeg as soon as the session is stopped or the
//! consumer is dropped.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    io::{self, Read, Seek, SeekFrom},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use symphonia::core::io::MediaSource as SymphoniaSource;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, Command},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CacheWriter, ContentCache},
    config::PipelineConfig,
    error::{PlayerError, PlayerResult},
    sources::formats::{BoxedReader, InputSource, StreamInput},
};

const CHUNK_SIZE: usize = 16 * 1024;
/// Chunks buffered between ffmpeg and the voice driver.
const CHANNEL_CAPACITY: usize = 64;
const FIRST_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// ffmpeg arguments for an input, output always opus in webm on stdout.
pub fn ffmpeg_args(input: &StreamInput) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    // stdin carries the audio for byte-source inputs.
    if !matches!(input.source, InputSource::Reader(_)) {
        args.push("-nostdin".to_string());
    }
    args.extend(["-loglevel", "error"].iter().map(|s| s.to_string()));

    if input.source.is_network() {
        if let Some(proxy) = &input.proxy {
            args.extend(["-http_proxy".to_string(), proxy.clone()]);
        }
    }

    args.extend(input.input_options.iter().cloned());
    args.extend(["-i".to_string(), input.source.as_arg()]);
    args.extend(
        ["-vn", "-c:a", "libopus", "-f", "webm", "pipe:1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Blocking reader over the relayed output.
///
/// Reads block until the next chunk arrives and return 0 once the relay has
/// finished or been stopped.
pub struct PipelineStream {
    rx: flume::Receiver<Bytes>,
    pending: Bytes,
}

impl Read for PipelineStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }

        let n = out.len().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        out[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}

impl Seek for PipelineStream {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "pipeline output is not seekable",
        ))
    }
}

impl SymphoniaSource for PipelineStream {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Control side of a running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    cancel: CancellationToken,
    caching: bool,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stops the session. A caching relay detaches from the listener and keeps
    /// writing the cache entry; any other relay kills ffmpeg.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_caching(&self) -> bool {
        self.caching
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// A live pipeline: the stream for the voice driver plus its handle.
pub struct Pipeline {
    pub stream: PipelineStream,
    pub handle: PipelineHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    /// ffmpeg closed its output.
    Eof,
    /// Stopped or abandoned while not caching.
    Stopped,
    /// Reading ffmpeg's output failed.
    Failed,
}

/// Moves chunks from `reader` to `tx` and into `cache`. Returns how the relay
/// ended and the cache writer if it is still intact.
async fn relay<R>(
    mut reader: R,
    tx: flume::Sender<Bytes>,
    mut cache: Option<CacheWriter>,
    cancel: CancellationToken,
) -> (RelayEnd, Option<CacheWriter>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut listener = Some(tx);

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled(), if listener.is_some() => {
                if cache.is_none() {
                    return (RelayEnd::Stopped, None);
                }
                debug!("Session stopped, finishing cache entry in background");
                listener = None;
                continue;
            }
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => return (RelayEnd::Eof, cache),
            Ok(n) => n,
            Err(e) => {
                warn!("Error reading transcoder output: {}", e);
                return (RelayEnd::Failed, cache);
            }
        };
        let chunk = Bytes::copy_from_slice(&buf[..n]);

        if let Some(writer) = cache.as_mut() {
            if let Err(e) = writer.write(&chunk).await {
                warn!("Cache write failed, streaming without cache: {}", e);
                cache = None;
            }
        }

        if let Some(tx) = &listener {
            let sent = tokio::select! {
                _ = cancel.cancelled() => Err(()),
                sent = tx.send_async(chunk) => sent.map_err(|_| ()),
            };
            if sent.is_err() {
                listener = None;
            }
        }

        if listener.is_none() && cache.is_none() {
            return (RelayEnd::Stopped, None);
        }
    }
}

impl Pipeline {
    /// Starts relaying `reader`. `first` is output already read from it.
    /// `child` is the producing process, if there is one.
    pub fn from_reader<R>(reader: R, first: Option<Bytes>, cache: Option<CacheWriter>, child: Option<Child>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = flume::bounded(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let caching = cache.is_some();

        let relay_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut cache = cache;
            if let Some(first) = first {
                if let Some(writer) = cache.as_mut() {
                    if let Err(e) = writer.write(&first).await {
                        warn!("Cache write failed, streaming without cache: {}", e);
                        cache = None;
                    }
                }
                let _ = tx.send_async(first).await;
            }

            let (end, writer) = relay(reader, tx, cache, relay_cancel).await;
            finish_session(end, writer, child).await;
        });

        Self {
            stream: PipelineStream { rx, pending: Bytes::new() },
            handle: PipelineHandle { cancel, caching, task },
        }
    }
}

async fn finish_session(end: RelayEnd, writer: Option<CacheWriter>, child: Option<Child>) {
    let exited_cleanly = match child {
        Some(mut child) => {
            if end != RelayEnd::Eof {
                let _ = child.start_kill();
            }
            match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    warn!("Error waiting for ffmpeg: {}", e);
                    false
                }
            }
        }
        None => true,
    };

    match writer {
        Some(writer) if end == RelayEnd::Eof && exited_cleanly => {
            let written = writer.written();
            match writer.finish().await {
                Ok(path) => info!("💾 Cached {} bytes at {}", written, path.display()),
                Err(e) => error!("Failed to commit cache entry: {:?}", e),
            }
        }
        Some(_) => debug!("Discarding incomplete cache entry ({:?})", end),
        None => {}
    }
}

/// Creates pipelines for resolved inputs.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn open(&self, input: StreamInput) -> PlayerResult<Pipeline>;
}

/// Spawns ffmpeg for every pipeline.
pub struct FfmpegPipeline {
    cache: Arc<dyn ContentCache>,
    config: Arc<PipelineConfig>,
}

impl FfmpegPipeline {
    pub fn new(cache: Arc<dyn ContentCache>, config: Arc<PipelineConfig>) -> Self {
        Self { cache, config }
    }

    async fn open_cache_writer(&self, key: &str) -> Option<CacheWriter> {
        match self.cache.open_write_stream(key).await {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!("Could not open cache entry {}: {:?}", key, e);
                None
            }
        }
    }
}

fn drain_stderr(stderr: Option<ChildStderr>, last_line: Arc<Mutex<Option<String>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("ffmpeg: {}", line);
            *last_line.lock() = Some(line);
        }
    })
}

/// Copies a byte source into ffmpeg's stdin, closing it at the end so ffmpeg
/// sees EOF. Ends early once ffmpeg stops reading.
fn feed_stdin(mut reader: BoxedReader, stdin: Option<ChildStdin>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut stdin) = stdin else { return };
        match tokio::io::copy(&mut reader, &mut stdin).await {
            Ok(n) => debug!("Fed {} bytes to ffmpeg", n),
            Err(e) => debug!("ffmpeg stopped reading its input: {}", e),
        }
    })
}

#[async_trait]
impl StreamFactory for FfmpegPipeline {
    async fn open(&self, input: StreamInput) -> PlayerResult<Pipeline> {
        let args = ffmpeg_args(&input);
        debug!("🎬 Starting ffmpeg: {:?}", args);

        let feed = match &input.source {
            InputSource::Reader(source) => Some(source.take().ok_or_else(|| {
                PlayerError::Pipeline(format!("Stream for {} was already consumed", source.label()))
            })?),
            _ => None,
        };

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(if feed.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlayerError::Pipeline(format!("Failed to spawn ffmpeg: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlayerError::Pipeline("ffmpeg stdout unavailable".to_string()))?;
        let last_line = Arc::new(Mutex::new(None));
        let stderr_task = drain_stderr(child.stderr.take(), last_line.clone());
        if let Some(reader) = feed {
            feed_stdin(reader, child.stdin.take());
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        let first = tokio::time::timeout(FIRST_CHUNK_TIMEOUT, stdout.read(&mut buf)).await;

        let n = match first {
            Ok(Ok(n)) if n > 0 => n,
            Ok(result) => {
                let status = child.wait().await;
                let _ = stderr_task.await;
                let reason = match result {
                    Err(e) => e.to_string(),
                    Ok(_) => last_line.lock().take().unwrap_or_else(|| "no output".to_string()),
                };
                return Err(PlayerError::Pipeline(format!(
                    "ffmpeg exited ({}) before producing audio: {reason}",
                    status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string()),
                )));
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(PlayerError::Pipeline(format!(
                    "ffmpeg produced no audio within {}s",
                    FIRST_CHUNK_TIMEOUT.as_secs()
                )));
            }
        };
        buf.truncate(n);

        let cache = match &input.cache_key {
            Some(key) => self.open_cache_writer(key).await,
            None => None,
        };

        Ok(Pipeline::from_reader(stdout, Some(Bytes::from(buf)), cache, Some(child)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Produces endless silence for every input.
    #[derive(Default)]
    pub struct FakeStreamFactory {
        pub opened: Mutex<Vec<StreamInput>>,
    }

    impl FakeStreamFactory {
        pub fn opened(&self) -> Vec<StreamInput> {
            self.opened.lock().clone()
        }
    }

    #[async_trait]
    impl StreamFactory for FakeStreamFactory {
        async fn open(&self, input: StreamInput) -> PlayerResult<Pipeline> {
            self.opened.lock().push(input);
            Ok(Pipeline::from_reader(tokio::io::repeat(0), None, None, None))
        }
    }
}
