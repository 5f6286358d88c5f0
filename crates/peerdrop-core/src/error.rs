//! Error types for PeerDrop.
//!
//! This module provides a unified error type for all PeerDrop operations,
//! with specific error variants for the protocol's failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for PeerDrop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for PeerDrop.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid protocol message (PD001)
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// A data or control frame referenced an unknown transfer (PD002)
    #[error("no active transfer with id '{0}'")]
    TransferNotFound(String),

    /// A data frame would write past the end of the transfer buffer (PD003)
    #[error(
        "chunk for transfer '{transfer_id}' exceeds buffer: offset {offset} + {len} bytes > {capacity} bytes"
    )]
    BufferOverflow {
        /// Transfer the frame belonged to
        transfer_id: String,
        /// Declared write offset
        offset: u64,
        /// Decoded chunk length
        len: u64,
        /// Allocated buffer length
        capacity: u64,
    },

    /// No data arrived within the stall window (PD004)
    #[error("transfer '{transfer_id}' stalled: no progress detected for {seconds} seconds")]
    StallTimeout {
        /// Transfer that stalled
        transfer_id: String,
        /// Length of the silence window
        seconds: u64,
    },

    /// The underlying channel failed (PD005)
    #[error("channel failure: {0}")]
    ChannelFailed(String),

    /// The underlying channel is closed
    #[error("channel closed")]
    ChannelClosed,

    /// The remote peer reported an error for a transfer (PD006)
    #[error("remote peer reported an error for transfer '{transfer_id}': {message}")]
    RemoteError {
        /// Transfer the error refers to
        transfer_id: String,
        /// Message supplied by the remote peer
        message: String,
    },

    /// Declared file size cannot be represented on the wire
    #[error("file size {0} bytes exceeds the 4 GiB protocol limit")]
    FileTooLarge(u64),

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    TransferCancelled,

    /// A newer FILE_START replaced this transfer
    #[error("transfer superseded by a new FILE_START")]
    TransferSuperseded,

    /// Compression or decompression failed
    #[error("codec error: {0}")]
    Codec(String),

    /// A chunk could not be sent after all retry attempts
    #[error("chunk at offset {offset} of transfer '{transfer_id}' failed after {attempts} attempts")]
    RetriesExhausted {
        /// Transfer the chunk belongs to
        transfer_id: String,
        /// Offset of the abandoned chunk
        offset: u64,
        /// Number of attempts made
        attempts: u32,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern PDXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::ProtocolError(_) => Some("PD001"),
            Self::TransferNotFound(_) => Some("PD002"),
            Self::BufferOverflow { .. } => Some("PD003"),
            Self::StallTimeout { .. } => Some("PD004"),
            Self::ChannelFailed(_) => Some("PD005"),
            Self::RemoteError { .. } => Some("PD006"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChannelFailed(_) | Self::StallTimeout { .. } | Self::Io(_)
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::StallTimeout { .. } => Some(
                "The peer stopped sending data. Check that both peers are still connected\n\
                 and restart the transfer.",
            ),
            Self::ChannelFailed(_) => Some(
                "The peer connection failed. Reconnect through the rendezvous service\n\
                 and send the file again.",
            ),
            Self::FileTooLarge(_) => Some("Split the file into parts smaller than 4 GiB."),
            Self::ConfigError(_) | Self::InvalidConfig { .. } => {
                Some("Run `peerdrop config reset` to restore the default configuration.")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::ProtocolError("x".into()).code(), Some("PD001"));
        assert_eq!(Error::TransferNotFound("t1".into()).code(), Some("PD002"));
        assert_eq!(
            Error::TransferNotFound("t1".into()).to_string(),
            "no active transfer with id 't1'"
        );
        assert_eq!(Error::TransferCancelled.code(), None);
    }

    #[test]
    fn test_buffer_overflow_message() {
        let err = Error::BufferOverflow {
            transfer_id: "t1".to_string(),
            offset: 900,
            len: 200,
            capacity: 1000,
        };
        let message = err.to_string();
        assert!(message.contains("t1"));
        assert!(message.contains("900"));
        assert!(message.contains("1000"));
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::ChannelFailed("ice".into()).is_recoverable());
        assert!(!Error::TransferCancelled.is_recoverable());
        assert!(Error::StallTimeout {
            transfer_id: "t".into(),
            seconds: 30
        }
        .is_recoverable());
    }
}
