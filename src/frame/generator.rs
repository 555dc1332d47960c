//! Frame to byte-stream encoder.

use super::{mask::apply_mask, Frame};
use byteorder::{ByteOrder, NetworkEndian};
use log::*;

/// Encodes frames into their RFC 6455 wire form.
///
/// Lengths always use the minimal encoding. A frame whose header carries a
/// masking key gets its payload XORed with that key while it is copied out;
/// the frame itself keeps the decoded payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct Generator;

impl Generator {
    /// Append the wire form of `frame` to `out`.
    pub fn generate(&self, frame: &Frame, out: &mut Vec<u8>) {
        trace!("writing frame {}", frame);
        out.reserve(frame.len());

        let header = frame.header();
        let code: u8 = header.opcode.into();
        out.push(
            (u8::from(header.is_final) << 7)
                | (u8::from(header.rsv1) << 6)
                | (u8::from(header.rsv2) << 5)
                | (u8::from(header.rsv3) << 4)
                | code,
        );

        let masked_bit = if header.mask.is_some() { 0x80 } else { 0 };
        let length = frame.payload().len();
        if length <= 125 {
            out.push(masked_bit | length as u8);
        } else if length <= 65535 {
            out.push(masked_bit | 126);
            let mut extended = [0; 2];
            NetworkEndian::write_u16(&mut extended, length as u16);
            out.extend_from_slice(&extended);
        } else {
            out.push(masked_bit | 127);
            let mut extended = [0; 8];
            NetworkEndian::write_u64(&mut extended, length as u64);
            out.extend_from_slice(&extended);
        }

        match header.mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let payload_start = out.len();
                out.extend_from_slice(frame.payload());
                apply_mask(&mut out[payload_start..], key);
            }
            None => out.extend_from_slice(frame.payload()),
        }
    }
}
