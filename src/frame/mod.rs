//! The frame value and its byte-level codec seams.

pub mod coding;
pub mod generator;
pub mod mask;
pub mod parser;
mod utf8;

pub use self::{
    generator::Generator,
    parser::Parser,
    utf8::{Utf8Bytes, Utf8Validator},
};

use self::coding::{CloseCode, Control, OpCode};
use crate::error::{Error, ProtocolError, Result};
use byteorder::{ByteOrder, NetworkEndian};
use bytes::Bytes;
use std::fmt;

/// A struct representing the close command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseFrame {
    /// The reason as a code.
    pub code: CloseCode,
    /// The reason as text string.
    pub reason: Utf8Bytes,
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// Flags, opcode and masking key of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented message.
    pub is_final: bool,
    /// Reserved for protocol extensions; the engine rejects inbound frames
    /// that have any of these set.
    pub rsv1: bool,
    /// Second reserved bit.
    pub rsv2: bool,
    /// Third reserved bit.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any.
    pub mask: Option<[u8; 4]>,
}

impl Default for FrameHeader {
    fn default() -> Self {
        FrameHeader {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Control(Control::Close),
            mask: None,
        }
    }
}

impl FrameHeader {
    /// Wire length of the header for the given payload length.
    pub fn len(&self, payload_len: u64) -> usize {
        2 + match payload_len {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        } + if self.mask.is_some() { 4 } else { 0 }
    }
}

/// A single RFC 6455 frame. The payload is kept in decoded (unmasked)
/// form; a masked frame applies its key only when it hits the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Wire length of the frame: header plus payload.
    #[inline]
    pub fn len(&self) -> usize {
        let length = self.payload.len();
        self.header.len(length as u64) + length
    }

    /// Test whether the frame carries no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Get a reference to the frame's header.
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Get a mutable reference to the frame's header.
    #[inline]
    pub fn header_mut(&mut self) -> &mut FrameHeader {
        &mut self.header
    }

    /// Get a reference to the frame's payload.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Test whether the frame carries a masking key.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.header.mask.is_some()
    }

    /// Consume the frame into its payload.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Assemble a frame from a parsed header and a decoded payload.
    pub(crate) fn from_payload(header: FrameHeader, payload: Bytes) -> Self {
        Frame { header, payload }
    }

    /// Create a new data frame.
    #[inline]
    pub fn message(payload: impl Into<Bytes>, opcode: OpCode, is_final: bool) -> Frame {
        debug_assert!(matches!(opcode, OpCode::Data(_)), "Invalid opcode for data frame");
        Frame {
            header: FrameHeader { is_final, opcode, ..FrameHeader::default() },
            payload: payload.into(),
        }
    }

    /// Create a new Ping control frame.
    #[inline]
    pub fn ping(payload: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader { opcode: OpCode::Control(Control::Ping), ..FrameHeader::default() },
            payload: payload.into(),
        }
    }

    /// Create a new Pong control frame.
    #[inline]
    pub fn pong(payload: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader { opcode: OpCode::Control(Control::Pong), ..FrameHeader::default() },
            payload: payload.into(),
        }
    }

    /// Create a new Close control frame. `None` produces the code-less form.
    #[inline]
    pub fn close(close: Option<CloseFrame>) -> Frame {
        let payload = if let Some(CloseFrame { code, reason }) = close {
            let mut buf = Vec::with_capacity(2 + reason.len());
            buf.extend_from_slice(&[0, 0]);
            NetworkEndian::write_u16(&mut buf, code.into());
            buf.extend_from_slice(reason.as_str().as_bytes());
            Bytes::from(buf)
        } else {
            Bytes::new()
        };
        Frame { header: FrameHeader::default(), payload }
    }

    /// Interpret the frame as a close frame payload.
    ///
    /// A one-byte payload cannot carry a status code and is a protocol
    /// error; a non-UTF-8 reason maps to close code 1007.
    pub(crate) fn into_close(self) -> Result<Option<CloseFrame>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol(ProtocolError::InvalidCloseSequence)),
            _ => {
                let code = NetworkEndian::read_u16(&self.payload[..2]).into();
                let reason = Utf8Bytes::try_from(self.payload.slice(2..))?;
                Ok(Some(CloseFrame { code, reason }))
            }
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<FRAME {} final={} masked={} payload_length={}>",
            self.header.opcode,
            self.header.is_final,
            self.is_masked(),
            self.payload.len(),
        )
    }
}
