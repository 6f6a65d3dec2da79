use thiserror::Error;

/// Broad classes of player failures, used by callers to decide how to report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request from the user; nothing changed.
    UserInput,
    /// A single song could not be resolved or streamed; the player moves on.
    TransientSource,
    /// A direct cache reference pointed at nothing.
    ResourceExhaustion,
    /// The player needs a voice connection it does not have.
    ConnectionState,
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Not connected to a voice channel.")]
    NotConnected,

    #[error("Queue empty.")]
    QueueEmpty,

    #[error("Not currently playing.")]
    NotPlaying,

    #[error("Seek position {target}s is outside the range of the song ({length}s).")]
    SeekOutOfRange { target: u64, length: u64 },

    #[error("Can't seek in a livestream.")]
    LiveSeek,

    #[error("No songs in queue to forward to.")]
    NothingToForward,

    #[error("No songs in queue to go back to.")]
    NothingToGoBack,

    #[error("Index {index} is outside the range of the queue ({size} songs).")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("Volume must be between 0 and 100, got {0}.")]
    InvalidVolume(u16),

    #[error("Cache file {0} not found")]
    CacheMiss(String),

    #[error("Can't find suitable format.")]
    NoSuitableFormat,

    #[error("Source is no longer available: {0}")]
    SourceGone(String),

    #[error("Format probe failed: {0}")]
    Probe(String),

    #[error("Transcoder failed before producing audio: {0}")]
    Pipeline(String),

    #[error("Voice transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::NotConnected | PlayerError::Transport(_) => ErrorKind::ConnectionState,
            PlayerError::QueueEmpty
            | PlayerError::NotPlaying
            | PlayerError::SeekOutOfRange { .. }
            | PlayerError::LiveSeek
            | PlayerError::NothingToForward
            | PlayerError::NothingToGoBack
            | PlayerError::IndexOutOfRange { .. }
            | PlayerError::InvalidVolume(_) => ErrorKind::UserInput,
            PlayerError::CacheMiss(_) => ErrorKind::ResourceExhaustion,
            PlayerError::NoSuitableFormat
            | PlayerError::SourceGone(_)
            | PlayerError::Probe(_)
            | PlayerError::Pipeline(_)
            | PlayerError::Io(_) => ErrorKind::TransientSource,
        }
    }

    /// Song-level failures the playback loop skips past instead of reporting.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientSource
    }
}

pub type PlayerResult<T> = std::result::Result<T, PlayerError>;
