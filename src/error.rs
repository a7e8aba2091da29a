//! Error types for the messenger surface.

use std::io;

use thiserror::Error;

/// Errors surfaced by [`Messenger`](crate::Messenger) operations.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// The address of a message or subscription could not be used.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A wait bounded by the configured timeout expired before its
    /// condition held.
    #[error("operation timed out")]
    Timeout,

    /// The messenger has no driver: `start` was not called, or `stop`
    /// already ran.
    #[error("messenger is not started")]
    NotStarted,

    /// An I/O error outside the per-connector pump (driver or listener
    /// creation). Transport errors on individual connections are logged
    /// and degrade that connection instead of surfacing here.
    #[error("I/O error: {0}")]
    Io(String),

    /// A message could not be decoded from a received delivery.
    #[error("message decoding failed: {0}")]
    Decode(String),

    /// A message could not be encoded for transfer.
    #[error("message encoding failed: {0}")]
    Encode(String),
}

impl From<io::Error> for MessengerError {
    fn from(error: io::Error) -> Self {
        MessengerError::Io(error.to_string())
    }
}

/// Result type for messenger operations.
pub type MessengerResult<T> = Result<T, MessengerError>;
