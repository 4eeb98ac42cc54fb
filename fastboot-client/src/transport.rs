use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Faults of the USB layer
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum TransportError {
    #[error("Transfer timed out")]
    Timeout,
    #[error("Endpoint stalled")]
    Stall,
    #[error("Device disconnected")]
    Disconnected,
    #[error("Transport is closed")]
    Closed,
    #[error("USB I/O error: {0}")]
    Io(String),
}

/// Bulk transport to a fastboot device
///
/// One bulk OUT and one bulk IN endpoint. Replies are framed: a single read
/// returns the bytes of exactly one IN transfer. Writes submit the given
/// bytes contiguously; splitting into endpoint-sized packets is left to the
/// USB stack.
#[async_trait]
pub trait Transport: Send {
    /// Bulk OUT transfer, returning the number of bytes written
    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// A single bulk IN transfer of at most `max_len` bytes
    async fn read(&mut self, max_len: usize, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;

    /// Preferred size for a single bulk OUT submission
    ///
    /// The client slices DATA-phase payloads to this size so cancellation
    /// and progress get a say between submissions.
    fn max_transfer_size(&self) -> usize {
        1024 * 1024
    }

    /// Release the interface; further transfers fail with
    /// [TransportError::Closed]
    async fn close(&mut self);
}
