#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Not enough bytes; got {actual}, need at least {minimum}")]
    NotEnoughData { actual: usize, minimum: usize },

    /// Datagram is not a recognized VITA-49 frame.
    #[error("not a VITA-49 packet: {0}")]
    Decode(String),

    /// Packet belongs to a stream outside the configured channel mask.
    #[error("stream {stream_id:#x} is not selected")]
    Filtered { stream_id: u32 },

    #[error("invalid channel set: {0}")]
    InvalidChannelSet(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The stream identifier does not intersect any configured channel.
    #[error("stream id {stream_id:#x} matches no configured channel")]
    ChannelMismatch { stream_id: u32 },

    #[error("packet carries {samples} samples but frames hold at most {capacity}")]
    FrameOverflow { samples: usize, capacity: usize },

    #[error("could not connect to ring buffer: {0}")]
    SinkConnect(String),

    #[error("error writing buffer to ring buffer: {0}")]
    SinkWriteFailed(String),

    #[error("could not write ring buffer header: {0}")]
    HeaderWrite(String),

    #[error("header is {len} bytes, larger than the {max} byte header block")]
    HeaderOverflow { len: usize, max: usize },

    #[error("ring buffer teardown failed: {0}")]
    SinkTeardown(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Returns true for errors that only invalidate the current datagram.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::Filtered { .. })
    }
}

#[cfg(feature = "zmq")]
impl From<zmq::Error> for Error {
    fn from(err: zmq::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
