//! Error taxonomy shared by every playback stage.

use std::io;

/// Errors surfaced by byte sources, the decoding adapter, the output sink and the player.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// A transport call was made before `init()` or after `destroy()`.
    #[error("player is not initialized")]
    Uninitialized,

    /// A byte source could not be probed or opened.
    #[error("open failed: {0}")]
    Open(String),

    /// The media has no audio stream or no codec is available for it.
    #[error("no decoder available: {0}")]
    NoDecoder(String),

    /// The seek target is unreachable or the decode engine rejected the seek.
    #[error("seek failed: {0}")]
    Seek(String),

    /// Unrecoverable codec or demux failure mid-stream.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The audio output device is unavailable.
    #[error("audio output unavailable: {0}")]
    SinkCreation(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = PlayerError> = std::result::Result<T, E>;

impl PlayerError {
    /// Wrap this error for a `std::io::Read`/`Seek` boundary.
    ///
    /// The original variant survives inside the `io::Error` and comes back out through
    /// [`PlayerError::from_io`].
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            PlayerError::Seek(_) => io::ErrorKind::InvalidInput,
            PlayerError::Decode(_) => io::ErrorKind::InvalidData,
            PlayerError::Open(_) => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        match self {
            PlayerError::Io(err) => err,
            other => io::Error::new(kind, other),
        }
    }

    /// Recover a [`PlayerError`] that crossed a std I/O boundary.
    pub fn from_io(err: io::Error) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<PlayerError>())
        {
            return PlayerError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<PlayerError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => PlayerError::Io(io::Error::other(other)),
            None => PlayerError::Io(io::Error::other("unknown i/o failure")),
        }
    }
}
