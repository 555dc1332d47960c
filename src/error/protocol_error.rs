use crate::frame::coding::Data;
use std::fmt;

/// Indicates the specific type/cause of a protocol error.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum ProtocolError {
    /// Not allowed to send data frames after having queued a closing frame.
    SendAfterClosing,
    /// Remote sent a frame after completing its side of the close handshake.
    ReceivedAfterClosing,
    /// Reserved bits in frame header are non-zero with no extension negotiated.
    NonZeroReservedBits,
    /// The server must close the connection when an unmasked frame is received.
    UnmaskedFrameFromClient,
    /// The client must close the connection when a masked frame is received.
    MaskedFrameFromServer,
    /// Control frames must not be fragmented.
    FragmentedControlFrame,
    /// Control frames must have a payload of 125 bytes or less.
    ControlFrameTooBig,
    /// Received a continuation frame despite there being nothing to continue.
    UnexpectedContinuationFrame,
    /// Received a new data frame while waiting for more fragments.
    ExpectedFragment(Data),
    /// Connection closed without performing the closing handshake.
    ResetWithoutClosingHandshake,
    /// Encountered an invalid opcode.
    InvalidOpcode(u8),
    /// Extended payload length uses a wider encoding than the value needs.
    NonMinimalLengthEncoding,
    /// 64-bit payload length with the high bit set.
    InvalidPayloadLength,
    /// The payload for the closing frame is invalid.
    InvalidCloseSequence,
    /// The closing frame carries a status code that must not appear on the wire.
    InvalidCloseCode(u16),
}

impl fmt::Debug for ProtocolError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SendAfterClosing => write!(f, "Sending after closing is not allowed"),
            Self::ReceivedAfterClosing => write!(f, "Remote sent after having closed"),
            Self::NonZeroReservedBits => write!(f, "Reserved bits are non-zero"),
            Self::UnmaskedFrameFromClient => write!(f, "Received an unmasked frame from client"),
            Self::MaskedFrameFromServer => write!(f, "Received a masked frame from server"),
            Self::FragmentedControlFrame => write!(f, "Fragmented control frame"),
            Self::ControlFrameTooBig => {
                write!(f, "Control frame too big (payload must be 125 bytes or less)")
            }
            Self::UnexpectedContinuationFrame => {
                write!(f, "Continuation frame but nothing to continue")
            }
            Self::ExpectedFragment(elem) => {
                write!(f, "While waiting for more fragments received: {}", elem)
            }
            Self::ResetWithoutClosingHandshake => {
                write!(f, "Connection reset without closing handshake")
            }
            Self::InvalidOpcode(elem) => write!(f, "Encountered invalid opcode: {}", elem),
            Self::NonMinimalLengthEncoding => {
                write!(f, "Extended payload length is not minimally encoded")
            }
            Self::InvalidPayloadLength => write!(f, "Payload length has the high bit set"),
            Self::InvalidCloseSequence => write!(f, "Invalid close sequence"),
            Self::InvalidCloseCode(elem) => write!(f, "Invalid close code: {}", elem),
        }
    }
}

impl fmt::Display for ProtocolError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for ProtocolError {}
