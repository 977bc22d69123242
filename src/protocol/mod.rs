//! The wire protocol: framing, primitive codec, and the command catalog.
//!
//! Frames are length-prefixed in both directions; the 32-bit little-endian
//! total length counts from its own first byte:
//!
//! ```text
//! [u32 LE total length][varint count][u8 batch policy][bodies...]   request
//! [u32 LE total length][varint count][bodies...]                    response
//! ```
//!
//! Each request body is a varint message type followed by type-specific
//! fields. Each response body is a varint message type and a varint result
//! code, then the reply fields on success or an error string otherwise.

pub mod buffer;
pub mod command;

mod error;

use enum_primitive_derive::Primitive;

pub use buffer::{varint_len, Buffer, CodecError};
pub use command::*;
pub use error::*;

/// Protocol version implemented by this library.
pub const PROTOCOL_VERSION: u64 = 1;

/// Space reserved at the front of a request buffer for the frame header:
/// a 4-byte length, a varint command count of up to 10 bytes, and the batch
/// policy byte. The real header is narrower when the count varint is short,
/// so it is written right-aligned against the first body byte.
pub const REQUEST_HEADER_RESERVE: usize = 4 + 10 + 1;

/// Default command and response buffer allocation.
pub const DEFAULT_BUFFER_SIZE: usize = 32768;

/// How a batch of commands reacts to a failing entry.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum BatchPolicy {
    /// Not batched: a single command flushed immediately.
    None = 0,
    /// Attempt every entry independently.
    Continue = 1,
    /// Stop at the first failing entry; the rest answer `Cancelled`.
    Abort = 2,
}

/// Writes the frame header into the reserved region of a request buffer and
/// returns the offset of the first wire byte.
///
/// The buffer must have been produced with [`REQUEST_HEADER_RESERVE`] bytes
/// reserved at the front. The header is placed so the frame is contiguous
/// whatever width the count varint takes.
pub fn finish_request(
    buf: &mut Buffer,
    count: u64,
    policy: BatchPolicy,
) -> Result<usize, CodecError> {
    let header_len = varint_len(count) + 1;
    let start = REQUEST_HEADER_RESERVE - 4 - header_len;
    let frame_len = (buf.used() - start) as u32;

    let mut header = [0u8; 11];
    let mut v = count;
    let mut at = 0;
    while v > 0x7f {
        header[at] = 0x80 | (v as u8 & 0x7f);
        v >>= 7;
        at += 1;
    }
    header[at] = v as u8;
    header[at + 1] = policy as u8;

    buf.patch_u32(start, frame_len)?;
    buf.patch_data(start + 4, &header[..header_len])?;
    Ok(start)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn finish_request_right_aligns_header() {
        let mut buf = Buffer::new(64);
        buf.put_data(&[0u8; REQUEST_HEADER_RESERVE]).unwrap();
        buf.put_varint(command::MessageType::Term as u64).unwrap();

        let start = finish_request(&mut buf, 1, BatchPolicy::None).unwrap();
        assert_eq!(start, REQUEST_HEADER_RESERVE - 4 - 2);

        let frame = &buf.bytes()[start..];
        // length counts from its own first byte: 4 + varint(1) + policy + body
        assert_eq!(frame, &[7, 0, 0, 0, 1, 0, 2]);
    }

    #[test]
    fn finish_request_wide_count() {
        let mut buf = Buffer::new(64);
        buf.put_data(&[0u8; REQUEST_HEADER_RESERVE]).unwrap();
        buf.put_u8(0xaa).unwrap();

        let start = finish_request(&mut buf, 300, BatchPolicy::Abort).unwrap();
        let frame = &buf.bytes()[start..];
        assert_eq!(frame, &[8, 0, 0, 0, 0xac, 0x02, 2, 0xaa]);
    }
}
