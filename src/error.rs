//! Error handling.

mod capacity_error;
mod protocol_error;

pub use self::{capacity_error::CapacityError, protocol_error::ProtocolError};

use crate::frame::coding::CloseCode;
use std::{io, str};
use thiserror::Error;

/// Result type of all engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible WebSocket errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The connection is closed; the close handshake finished normally.
    ///
    /// Receiving this is not an error by itself, it just tells that the
    /// connection is done and the transport may be dropped.
    #[error("Connection closed normally")]
    ConnectionClosed,
    /// Operating on a connection that already reached its terminal state.
    /// Indicates a program error on the caller side.
    #[error("Trying to work with closed connection")]
    AlreadyClosed,
    /// Input-output error from the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A configured size limit was exceeded.
    #[error("Space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// The peer violated the WebSocket protocol.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Invalid UTF-8 in a TEXT message or a close reason.
    #[error("UTF-8 encoding error")]
    Utf8,
    /// The send was cancelled before any of its bytes were staged for
    /// the transport.
    #[error("Send cancelled before reaching the transport")]
    Cancelled,
    /// A wait on a send handle ran past its deadline.
    #[error("Timed out waiting for completion")]
    Timeout,
}

impl Error {
    /// The close code written on the wire when this error fails the
    /// connection.
    ///
    /// Codes that are never valid on the wire (e.g. 1006 for transport
    /// failures) are only ever surfaced to local observers.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::Protocol(_) => CloseCode::Protocol,
            Error::Capacity(_) => CloseCode::Size,
            Error::Utf8 => CloseCode::Invalid,
            Error::Io(_) | Error::ConnectionClosed | Error::AlreadyClosed => CloseCode::Abnormal,
            _ => CloseCode::Error,
        }
    }
}

impl From<str::Utf8Error> for Error {
    fn from(_: str::Utf8Error) -> Self {
        Error::Utf8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_mapping() {
        assert_eq!(
            Error::Protocol(ProtocolError::NonZeroReservedBits).close_code(),
            CloseCode::Protocol
        );
        assert_eq!(
            Error::Capacity(CapacityError::MessageTooLong { size: 10, max_size: 5 }).close_code(),
            CloseCode::Size
        );
        assert_eq!(Error::Utf8.close_code(), CloseCode::Invalid);
        assert_eq!(Error::Timeout.close_code(), CloseCode::Error);
    }
}
