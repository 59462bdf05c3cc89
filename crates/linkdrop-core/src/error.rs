//! Error types for Linkdrop.
//!
//! This module provides a unified error type for all Linkdrop operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

use crate::transfer::TransferId;

/// A specialized `Result` type for Linkdrop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Linkdrop.
#[derive(Error, Debug)]
pub enum Error {
    /// The data channel is not open yet (E001)
    #[error("not connected: the data channel is not open")]
    NotConnected,

    /// The data channel closed underneath an operation (E002)
    #[error("data channel closed")]
    ChannelClosed,

    /// Candidate gathering did not complete in time (E003)
    #[error("candidate gathering timed out after {0} ms")]
    GatheringTimeout(u64),

    /// The connection did not become ready in time (E004)
    #[error("connection timed out after {0} ms")]
    ConnectTimeout(u64),

    /// End-to-end checksum mismatch after all bytes arrived (E005)
    #[error("checksum mismatch for transfer {id}: sender {local:#010x}, receiver {remote:#010x}")]
    ChecksumMismatch {
        /// The transfer that failed verification
        id: TransferId,
        /// Checksum computed by the sender
        local: u32,
        /// Checksum reported by the receiver
        remote: u32,
    },

    /// Transfer was cancelled
    #[error("transfer {id} cancelled: {reason}")]
    TransferCancelled {
        /// The cancelled transfer
        id: TransferId,
        /// Reason given by whoever cancelled
        reason: String,
    },

    /// A transfer with this id is already active
    #[error("transfer {0} is already active")]
    DuplicateTransfer(TransferId),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid user input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unsupported envelope version on the stream transport
    #[error("unsupported protocol version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
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

    /// History store error
    #[error("history store error: {0}")]
    HistoryError(String),

    /// The session task has stopped
    #[error("session has shut down")]
    SessionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::NotConnected => Some("E001"),
            Self::ChannelClosed => Some("E002"),
            Self::GatheringTimeout(_) => Some("E003"),
            Self::ConnectTimeout(_) => Some("E004"),
            Self::ChecksumMismatch { .. } => Some("E005"),
            _ => None,
        }
    }

    /// Returns whether this error can be recovered from by a fresh attempt.
    ///
    /// Connection-level failures need a new offer/answer cycle started by
    /// the user; an end-to-end checksum mismatch is terminal for the
    /// transfer and never retried automatically.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::ChannelClosed
                | Self::GatheringTimeout(_)
                | Self::ConnectTimeout(_)
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::GatheringTimeout(_) | Self::ConnectTimeout(_) | Self::ChannelClosed => Some(
                "Start a new offer/answer exchange to reconnect.\n\
                 Reconnection is never attempted automatically.",
            ),
            Self::ChecksumMismatch { .. } => {
                Some("The received file is corrupt. Send it again from the start.")
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
        assert_eq!(Error::NotConnected.code(), Some("E001"));
        assert_eq!(Error::GatheringTimeout(10_000).code(), Some("E003"));
        assert_eq!(Error::SessionClosed.code(), None);
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::ChannelClosed.is_recoverable());
        assert!(Error::GatheringTimeout(10_000).is_recoverable());

        let mismatch = Error::ChecksumMismatch {
            id: TransferId::from("t-1"),
            local: 1,
            remote: 2,
        };
        assert!(!mismatch.is_recoverable());
        assert!(mismatch.suggestion().is_some());
    }

    #[test]
    fn test_display_includes_hex_checksums() {
        let mismatch = Error::ChecksumMismatch {
            id: TransferId::from("t-1"),
            local: 0xdead_beef,
            remote: 0x0000_0001,
        };
        let text = mismatch.to_string();
        assert!(text.contains("0xdeadbeef"));
        assert!(text.contains("0x00000001"));
    }
}
