use thiserror::Error;

use crate::protocol::ResponseParseError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

/// Client operation errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("No device connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ResponseParseError),
    #[error("Unexpected reply from device")]
    UnexpectedReply,
    #[error("Command exceeds the 64 byte limit: {0:?}")]
    CommandTooLong(String),
    #[error("Device rejected command: {message}")]
    DeviceRejected { message: String },
    #[error("Image of {size} bytes exceeds the download limit of {max} bytes")]
    ImageTooLarge { size: u64, max: u64 },
    #[error("Sparse chunk too large: {0}")]
    SparseChunkTooLarge(String),
    #[error("Invalid sparse image: {0}")]
    InvalidSparse(String),
    #[error("Task has no image: {0}")]
    MissingImage(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Failed to allocate a {0} byte transfer buffer")]
    OutOfMemory(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the session is unusable after this error
    ///
    /// Transport faults and protocol violations leave the device state
    /// unknown; a device `FAIL` or a local error does not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Protocol(_) | Error::UnexpectedReply | Error::Cancelled
        )
    }

    /// Stable short name of the error kind, for summaries and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotConnected => "not-connected",
            Error::Transport(_) => "transport",
            Error::Protocol(_) | Error::UnexpectedReply => "protocol",
            Error::CommandTooLong(_) => "command-too-long",
            Error::DeviceRejected { .. } => "device-rejected",
            Error::ImageTooLarge { .. } => "image-too-large",
            Error::SparseChunkTooLarge(_) => "sparse-chunk-too-large",
            Error::InvalidSparse(_) => "invalid-sparse",
            Error::MissingImage(_) => "missing-image",
            Error::Cancelled => "cancelled",
            Error::OutOfMemory(_) => "out-of-memory",
            Error::Io(_) => "io",
        }
    }
}

impl From<sparse_image::stream::StreamError> for Error {
    fn from(e: sparse_image::stream::StreamError) -> Self {
        use sparse_image::stream::StreamError;
        match e {
            StreamError::Io(io) => Error::Io(io),
            StreamError::OutOfMemory { bytes } => Error::OutOfMemory(bytes),
            other @ StreamError::ChunkTooLarge { .. } => {
                Error::SparseChunkTooLarge(other.to_string())
            }
            other => Error::InvalidSparse(other.to_string()),
        }
    }
}
