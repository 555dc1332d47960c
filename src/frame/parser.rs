//! Stateful byte-stream to frame decoder.

use super::{
    coding::{Control, OpCode},
    mask::apply_mask,
    Frame, FrameHeader,
};
use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    policy::Role,
};
use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BytesMut};
use log::*;

/// Decoding step the parser resumes from. Every transition sits on a byte
/// boundary, so the transport may deliver input in arbitrary slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Waiting for the FIN/RSV/opcode byte.
    Start,
    /// Waiting for the MASK bit and the 7-bit length.
    Len7,
    /// Accumulating the 16-bit extended length.
    Len16,
    /// Accumulating the 64-bit extended length.
    Len64,
    /// Accumulating the 4-byte masking key.
    MaskKey,
    /// Accumulating the payload.
    Payload,
}

/// Decodes frames out of a byte stream, one `parse` call at a time.
///
/// The parser owns the partially decoded frame; unconsumed input stays in
/// the caller's buffer, so parsing can stop and resume at any byte.
#[derive(Debug)]
pub struct Parser {
    role: Role,
    max_frame_payload_size: Option<usize>,
    step: Step,
    header: FrameHeader,
    masked: bool,
    /// Multi-byte header fields under accumulation (extended length, mask key).
    scratch: [u8; 8],
    scratch_len: usize,
    length: usize,
    payload: BytesMut,
}

impl Parser {
    /// Create a parser for one side of a connection.
    ///
    /// `role` is the local role: a server requires inbound frames to be
    /// masked, a client requires them to be unmasked. Frames whose declared
    /// payload exceeds `max_frame_payload_size` are rejected before any
    /// payload is buffered.
    pub fn new(role: Role, max_frame_payload_size: Option<usize>) -> Self {
        Parser {
            role,
            max_frame_payload_size,
            step: Step::Start,
            header: FrameHeader::default(),
            masked: false,
            scratch: [0; 8],
            scratch_len: 0,
            length: 0,
            payload: BytesMut::new(),
        }
    }

    /// Consume bytes from `buf` until a frame completes or input runs out.
    ///
    /// Returns `Ok(None)` when more input is needed. The payload of a
    /// returned frame is already unmasked.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.step {
                Step::Start => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let first = buf[0];
                    buf.advance(1);
                    self.start_frame(first)?;
                }
                Step::Len7 => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let second = buf[0];
                    buf.advance(1);
                    self.read_len7(second)?;
                }
                Step::Len16 => {
                    if !self.fill_scratch(buf, 2) {
                        return Ok(None);
                    }
                    let length = NetworkEndian::read_u16(&self.scratch[..2]) as u64;
                    if length <= 125 {
                        return Err(Error::Protocol(ProtocolError::NonMinimalLengthEncoding));
                    }
                    self.finish_length(length)?;
                }
                Step::Len64 => {
                    if !self.fill_scratch(buf, 8) {
                        return Ok(None);
                    }
                    let length = NetworkEndian::read_u64(&self.scratch[..8]);
                    if length & (1 << 63) != 0 {
                        return Err(Error::Protocol(ProtocolError::InvalidPayloadLength));
                    }
                    if length <= 65535 {
                        return Err(Error::Protocol(ProtocolError::NonMinimalLengthEncoding));
                    }
                    self.finish_length(length)?;
                }
                Step::MaskKey => {
                    if !self.fill_scratch(buf, 4) {
                        return Ok(None);
                    }
                    let mut key = [0; 4];
                    key.copy_from_slice(&self.scratch[..4]);
                    self.header.mask = Some(key);
                    self.step = Step::Payload;
                }
                Step::Payload => {
                    let missing = self.length - self.payload.len();
                    let take = missing.min(buf.len());
                    self.payload.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    if self.payload.len() < self.length {
                        return Ok(None);
                    }
                    return Ok(Some(self.complete_frame()));
                }
            }
        }
    }

    fn start_frame(&mut self, first: u8) -> Result<()> {
        let opcode = OpCode::from(first & 0x0f);
        match opcode {
            OpCode::Data(super::coding::Data::Reserved(i))
            | OpCode::Control(Control::Reserved(i)) => {
                return Err(Error::Protocol(ProtocolError::InvalidOpcode(i)))
            }
            _ => {}
        }
        self.header = FrameHeader {
            is_final: first & 0x80 != 0,
            rsv1: first & 0x40 != 0,
            rsv2: first & 0x20 != 0,
            rsv3: first & 0x10 != 0,
            opcode,
            mask: None,
        };
        // MUST be 0 unless an extension is negotiated that defines meanings
        // for non-zero values (RFC 6455); no extension ever is here.
        if self.header.rsv1 || self.header.rsv2 || self.header.rsv3 {
            return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
        }
        self.step = Step::Len7;
        Ok(())
    }

    fn read_len7(&mut self, second: u8) -> Result<()> {
        self.masked = second & 0x80 != 0;
        match self.role {
            Role::Server if !self.masked => {
                return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient))
            }
            Role::Client if self.masked => {
                return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer))
            }
            _ => {}
        }

        let length7 = second & 0x7f;
        if self.header.opcode.is_control() {
            if !self.header.is_final {
                return Err(Error::Protocol(ProtocolError::FragmentedControlFrame));
            }
            if length7 > 125 {
                return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
            }
        }
        match length7 {
            126 => self.step = Step::Len16,
            127 => self.step = Step::Len64,
            _ => self.finish_length(length7 as u64)?,
        }
        Ok(())
    }

    /// The declared payload length is known; validate it and move on to the
    /// mask key or the payload.
    fn finish_length(&mut self, length: u64) -> Result<()> {
        if self.header.opcode == OpCode::Control(Control::Close) && length == 1 {
            return Err(Error::Protocol(ProtocolError::InvalidCloseSequence));
        }
        let max_size = self.max_frame_payload_size.unwrap_or(usize::MAX);
        if length > max_size as u64 {
            return Err(Error::Capacity(CapacityError::FrameTooLong {
                size: length.min(usize::MAX as u64) as usize,
                max_size,
            }));
        }
        self.length = length as usize;
        self.payload = BytesMut::with_capacity(self.length);
        self.step = if self.masked { Step::MaskKey } else { Step::Payload };
        Ok(())
    }

    /// Move up to `need - scratch_len` bytes into the scratch buffer.
    /// True once `need` bytes are available.
    fn fill_scratch(&mut self, buf: &mut BytesMut, need: usize) -> bool {
        let take = (need - self.scratch_len).min(buf.len());
        self.scratch[self.scratch_len..self.scratch_len + take].copy_from_slice(&buf[..take]);
        self.scratch_len += take;
        buf.advance(take);
        if self.scratch_len < need {
            return false;
        }
        self.scratch_len = 0;
        true
    }

    fn complete_frame(&mut self) -> Frame {
        let mut payload = std::mem::take(&mut self.payload);
        if let Some(mask) = self.header.mask {
            // The key offset counts from 0 over this frame's payload only.
            apply_mask(&mut payload, mask);
        }
        self.step = Step::Start;
        self.length = 0;
        let frame = Frame::from_payload(self.header, payload.freeze());
        trace!("received frame {}", frame);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::coding::Data;

    fn server_parser() -> Parser {
        Parser::new(Role::Server, None)
    }

    fn client_parser() -> Parser {
        Parser::new(Role::Client, None)
    }

    #[test]
    fn single_unmasked_text() {
        let mut buf = BytesMut::from(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f][..]);
        let frame = client_parser().parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header().opcode, OpCode::Data(Data::Text));
        assert!(frame.header().is_final);
        assert_eq!(&frame.payload()[..], b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn single_masked_text() {
        let mut buf = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let frame = server_parser().parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header().opcode, OpCode::Data(Data::Text));
        assert_eq!(frame.header().mask, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(&frame.payload()[..], b"Hello");
    }

    #[test]
    fn resumable_at_every_byte_boundary() {
        let wire = [0x81u8, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        for chunk_size in 1..wire.len() {
            let mut parser = server_parser();
            let mut frames = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                let mut buf = BytesMut::from(chunk);
                while let Some(frame) = parser.parse(&mut buf).unwrap() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames.len(), 1, "chunk size {}", chunk_size);
            assert_eq!(&frames[0].payload()[..], b"Hello");
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::from(&[0x89, 0x01, 0xaa, 0x8a, 0x02, 0x01, 0x02][..]);
        let mut parser = client_parser();
        let ping = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(ping.header().opcode, OpCode::Control(Control::Ping));
        let pong = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(pong.header().opcode, OpCode::Control(Control::Pong));
        assert_eq!(&pong.payload()[..], &[0x01, 0x02]);
    }

    #[test]
    fn sixteen_bit_length() {
        let mut wire = vec![0x82, 0x7e, 0x01, 0x00];
        wire.extend_from_slice(&[0x44; 256]);
        let mut buf = BytesMut::from(&wire[..]);
        let frame = client_parser().parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload().len(), 256);
        assert!(frame.payload().iter().all(|&b| b == 0x44));
    }

    #[test]
    fn sixty_four_bit_length() {
        let mut wire = vec![0x82, 0x7f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00];
        wire.extend_from_slice(&vec![0x77; 65536]);
        let mut buf = BytesMut::from(&wire[..]);
        let frame = client_parser().parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload().len(), 65536);
    }

    #[test]
    fn non_minimal_len16_rejected() {
        let mut buf = BytesMut::from(&[0x82, 0x7e, 0x00, 0x7d][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::NonMinimalLengthEncoding))
        ));
    }

    #[test]
    fn non_minimal_len64_rejected() {
        let mut buf = BytesMut::from(&[0x82, 0x7f, 0, 0, 0, 0, 0, 0, 0xff, 0xff][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::NonMinimalLengthEncoding))
        ));
    }

    #[test]
    fn high_bit_length_rejected() {
        let mut buf = BytesMut::from(&[0x82, 0x7f, 0x80, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::InvalidPayloadLength))
        ));
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut buf = BytesMut::from(&[0xc1, 0x01, 0x00][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::NonZeroReservedBits))
        ));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::InvalidOpcode(3)))
        ));
    }

    #[test]
    fn fragmented_control_rejected() {
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::FragmentedControlFrame))
        ));
    }

    #[test]
    fn oversized_control_rejected() {
        let mut buf = BytesMut::from(&[0x89, 0x7e, 0x01, 0x00][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::ControlFrameTooBig))
        ));
    }

    #[test]
    fn unmasked_frame_on_server_rejected() {
        let mut buf = BytesMut::from(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f][..]);
        assert!(matches!(
            server_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient))
        ));
    }

    #[test]
    fn masked_frame_on_client_rejected() {
        let mut buf = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::MaskedFrameFromServer))
        ));
    }

    #[test]
    fn close_payload_of_one_rejected() {
        let mut buf = BytesMut::from(&[0x88, 0x01, 0xe8][..]);
        assert!(matches!(
            client_parser().parse(&mut buf),
            Err(Error::Protocol(ProtocolError::InvalidCloseSequence))
        ));
    }

    #[test]
    fn frame_size_limit() {
        let mut buf = BytesMut::from(&[0x82, 0x7e, 0x01, 0x00][..]);
        let mut parser = Parser::new(Role::Client, Some(100));
        assert!(matches!(
            parser.parse(&mut buf),
            Err(Error::Capacity(CapacityError::FrameTooLong { size: 256, max_size: 100 }))
        ));
    }

    #[test]
    fn empty_payload_frame() {
        let mut buf = BytesMut::from(&[0x89, 0x00][..]);
        let frame = client_parser().parse(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }
}
