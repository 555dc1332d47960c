//! Whole messages and the reassembly of fragmented ones.

use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    frame::{
        coding::{Data, OpCode},
        Frame, Utf8Bytes, Utf8Validator,
    },
};
use bytes::{Bytes, BytesMut};
use std::fmt;

/// The kind of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text.
    Text,
    /// Opaque binary data.
    Binary,
}

impl MessageKind {
    pub(crate) fn opcode(self) -> OpCode {
        match self {
            MessageKind::Text => OpCode::Data(Data::Text),
            MessageKind::Binary => OpCode::Data(Data::Binary),
        }
    }
}

/// A complete application-level message.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    /// A text WebSocket message.
    Text(Utf8Bytes),
    /// A binary WebSocket message.
    Binary(Bytes),
}

impl Message {
    /// Create a new text message from a stringable.
    pub fn text<S>(string: S) -> Message
    where
        S: Into<Utf8Bytes>,
    {
        Message::Text(string.into())
    }

    /// Create a new binary message by converting to `Bytes`.
    pub fn binary<B>(bin: B) -> Message
    where
        B: Into<Bytes>,
    {
        Message::Binary(bin.into())
    }

    /// The kind of the message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::Binary(_) => MessageKind::Binary,
        }
    }

    /// Indicates whether a message is a text message.
    pub fn is_text(&self) -> bool {
        matches!(*self, Message::Text(_))
    }

    /// Indicates whether a message is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(*self, Message::Binary(_))
    }

    /// Get the length of the message payload.
    pub fn len(&self) -> usize {
        match self {
            Message::Text(string) => string.len(),
            Message::Binary(data) => data.len(),
        }
    }

    /// Returns true if the message has no content.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the message and return its payload.
    pub fn into_data(self) -> Bytes {
        match self {
            Message::Text(utf8) => utf8.into(),
            Message::Binary(data) => data,
        }
    }
}

impl From<String> for Message {
    #[inline]
    fn from(string: String) -> Self {
        Message::text(string)
    }
}

impl<'s> From<&'s str> for Message {
    #[inline]
    fn from(string: &'s str) -> Self {
        Message::text(string)
    }
}

impl From<Vec<u8>> for Message {
    #[inline]
    fn from(data: Vec<u8>) -> Self {
        Message::binary(data)
    }
}

impl From<Bytes> for Message {
    #[inline]
    fn from(data: Bytes) -> Self {
        Message::binary(data)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Text(string) => write!(f, "{}", string),
            Message::Binary(data) => write!(f, "Binary Data<length={}>", data.len()),
        }
    }
}

/// One message under reassembly.
///
/// Text fragments run through the incremental validator as they arrive, so
/// broken UTF-8 fails on the offending fragment rather than at the end.
#[derive(Debug)]
struct InProgress {
    kind: MessageKind,
    buf: BytesMut,
    validator: Utf8Validator,
}

impl InProgress {
    fn new(kind: MessageKind) -> Self {
        Self { kind, buf: BytesMut::new(), validator: Utf8Validator::default() }
    }

    fn extend(&mut self, tail: Bytes, size_limit: Option<usize>) -> Result<()> {
        // Always have a max size. This ensures an error in case of
        // concatenating two buffers of more than `usize::MAX` bytes in total.
        let max_size = size_limit.unwrap_or(usize::MAX);
        let my_size = self.buf.len();
        let portion_size = tail.len();
        // Be careful about integer overflows here.
        if my_size > max_size || portion_size > max_size - my_size {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: my_size.saturating_add(portion_size),
                max_size,
            }));
        }

        if let MessageKind::Text = self.kind {
            self.validator.feed(&tail)?;
        }
        self.buf.extend_from_slice(&tail);
        Ok(())
    }

    fn complete(mut self) -> Result<Message> {
        Ok(match self.kind {
            MessageKind::Binary => Message::Binary(self.buf.freeze()),
            MessageKind::Text => {
                self.validator.finish()?;
                // SAFETY: every fragment went through the validator and the
                // stream ended on a character boundary.
                Message::Text(unsafe { Utf8Bytes::from_bytes_unchecked(self.buf.freeze()) })
            }
        })
    }
}

/// Joins fragment chains back into whole messages.
///
/// Only data frames come through here; the session routes control frames
/// before they reach the assembler.
#[derive(Debug)]
pub struct Assembler {
    max_message_size: Option<usize>,
    current: Option<InProgress>,
}

impl Assembler {
    /// Create an assembler enforcing the given whole-message size limit.
    pub fn new(max_message_size: Option<usize>) -> Self {
        Assembler { max_message_size, current: None }
    }

    /// Feed one data frame. Returns a message when a chain completes.
    pub fn sink(&mut self, frame: Frame) -> Result<Option<Message>> {
        let fin = frame.header().is_final;
        match frame.header().opcode {
            OpCode::Data(Data::Continuation) => match self.current.take() {
                Some(mut current) => {
                    current.extend(frame.into_payload(), self.max_message_size)?;
                    if fin {
                        return current.complete().map(Some);
                    }
                    self.current = Some(current);
                    Ok(None)
                }
                None => Err(Error::Protocol(ProtocolError::UnexpectedContinuationFrame)),
            },
            OpCode::Data(data @ (Data::Text | Data::Binary)) => {
                if self.current.is_some() {
                    return Err(Error::Protocol(ProtocolError::ExpectedFragment(data)));
                }
                let kind = match data {
                    Data::Text => MessageKind::Text,
                    _ => MessageKind::Binary,
                };
                let mut message = InProgress::new(kind);
                message.extend(frame.into_payload(), self.max_message_size)?;
                if fin {
                    return message.complete().map(Some);
                }
                self.current = Some(message);
                Ok(None)
            }
            opcode => panic!("Bug: {} frame routed to assembler", opcode),
        }
    }

    /// Drop the partially assembled message, if any. Used when a close
    /// frame arrives mid-chain: the partial message is abandoned.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Tell whether a fragment chain is open.
    pub fn is_mid_message(&self) -> bool {
        self.current.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_frame(payload: &'static str, fin: bool) -> Frame {
        Frame::message(payload, OpCode::Data(Data::Text), fin)
    }

    fn continuation(payload: &'static [u8], fin: bool) -> Frame {
        Frame::message(payload, OpCode::Data(Data::Continuation), fin)
    }

    #[test]
    fn single_frame_message() {
        let mut assembler = Assembler::new(None);
        let message = assembler.sink(text_frame("Hello", true)).unwrap().unwrap();
        assert_eq!(message, Message::text("Hello"));
        assert!(!assembler.is_mid_message());
    }

    #[test]
    fn fragmented_message() {
        let mut assembler = Assembler::new(None);
        assert_eq!(assembler.sink(text_frame("Hel", false)).unwrap(), None);
        assert!(assembler.is_mid_message());
        let message = assembler.sink(continuation(b"lo", true)).unwrap().unwrap();
        assert_eq!(message, Message::text("Hello"));
    }

    #[test]
    fn payloads_concatenate_in_order() {
        let mut assembler = Assembler::new(None);
        assembler.sink(Frame::message(&b"ab"[..], OpCode::Data(Data::Binary), false)).unwrap();
        assembler.sink(continuation(b"cd", false)).unwrap();
        let message = assembler.sink(continuation(b"ef", true)).unwrap().unwrap();
        assert_eq!(message.into_data(), Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn continuation_without_start() {
        let mut assembler = Assembler::new(None);
        assert!(matches!(
            assembler.sink(continuation(b"lo", true)),
            Err(Error::Protocol(ProtocolError::UnexpectedContinuationFrame))
        ));
    }

    #[test]
    fn interleaved_message_start() {
        let mut assembler = Assembler::new(None);
        assembler.sink(text_frame("Hel", false)).unwrap();
        assert!(matches!(
            assembler.sink(text_frame("oops", true)),
            Err(Error::Protocol(ProtocolError::ExpectedFragment(Data::Text)))
        ));
    }

    #[test]
    fn size_limit_across_fragments() {
        let mut assembler = Assembler::new(Some(4));
        assembler.sink(text_frame("Hel", false)).unwrap();
        assert!(matches!(
            assembler.sink(continuation(b"lo", true)),
            Err(Error::Capacity(CapacityError::MessageTooLong { size: 5, max_size: 4 }))
        ));
    }

    #[test]
    fn utf8_split_across_fragments() {
        let mut assembler = Assembler::new(None);
        // "é" split between fragments.
        assembler
            .sink(Frame::message(&b"caf\xc3"[..], OpCode::Data(Data::Text), false))
            .unwrap();
        let message = assembler.sink(continuation(b"\xa9", true)).unwrap().unwrap();
        assert_eq!(message, Message::text("café"));
    }

    #[test]
    fn invalid_utf8_fails_before_fin() {
        let mut assembler = Assembler::new(None);
        assembler.sink(text_frame("ok", false)).unwrap();
        // Invalid already here; must not wait for the final fragment.
        assert!(matches!(assembler.sink(continuation(&[0xff], false)), Err(Error::Utf8)));
    }

    #[test]
    fn utf8_must_end_on_character_boundary() {
        let mut assembler = Assembler::new(None);
        assert!(matches!(
            assembler.sink(Frame::message(&b"\xc3"[..], OpCode::Data(Data::Text), true)),
            Err(Error::Utf8)
        ));
    }

    #[test]
    fn reset_abandons_partial_message() {
        let mut assembler = Assembler::new(None);
        assembler.sink(text_frame("Hel", false)).unwrap();
        assembler.reset();
        assert!(!assembler.is_mid_message());
        // A new message may start from scratch afterwards.
        let message = assembler.sink(text_frame("fresh", true)).unwrap().unwrap();
        assert_eq!(message, Message::text("fresh"));
    }
}
