//! Test message framing shared by the generator and the sink.
//!
//! ```text
//! 0      2       3            5               13
//! +------+-------+------------+---------------+---------+
//! | seq  | tclass| T|  size   | timestamp f64 | payload |
//! +------+-------+------------+---------------+---------+
//! ```
//!
//! All fields are big endian. `size` is the whole message including the
//! header; bit `T` flags the optional timestamp.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 5;
pub const TIMESTAMP_LEN: usize = 8;
/// Largest message the 15-bit size field can describe.
pub const MAX_MESSAGE_SIZE: usize = 0x7fff;

const TIMESTAMP_FLAG: u16 = 0x8000;
const SIZE_MASK: u16 = 0x7fff;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("zero sequence number")]
    ZeroSequence,
    #[error("zero length")]
    ZeroLength,
    #[error("size {0} is shorter than its own header")]
    Truncated(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub seq: u16,
    pub traffic_class: u8,
    /// Seconds since the UNIX epoch at send time.
    pub timestamp: Option<f64>,
    pub payload: Bytes,
}

/// Bytes in front of the payload.
pub fn prefix_len(timestamp: bool) -> usize {
    if timestamp {
        HEADER_LEN + TIMESTAMP_LEN
    } else {
        HEADER_LEN
    }
}

impl Message {
    /// Total encoded size, the value carried in the header.
    pub fn size(&self) -> usize {
        prefix_len(self.timestamp.is_some()) + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let size = self.size();
        debug_assert!(size <= MAX_MESSAGE_SIZE);
        let mut size_flags = size as u16 & SIZE_MASK;
        if self.timestamp.is_some() {
            size_flags |= TIMESTAMP_FLAG;
        }
        dst.reserve(size);
        dst.put_u16(self.seq);
        dst.put_u8(self.traffic_class);
        dst.put_u16(size_flags);
        if let Some(ts) = self.timestamp {
            dst.put_f64(ts);
        }
        dst.put_slice(&self.payload);
    }
}

/// Take the next whole message off the front of `src`.
///
/// Returns `Ok(None)` while the message is still incomplete. On error the
/// buffer is left as is; the stream cannot be resynchronised, so callers
/// drop whatever is buffered.
pub fn decode(src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let seq = u16::from_be_bytes([src[0], src[1]]);
    let traffic_class = src[2];
    let size_flags = u16::from_be_bytes([src[3], src[4]]);
    let size = (size_flags & SIZE_MASK) as usize;
    let timestamped = size_flags & TIMESTAMP_FLAG != 0;

    if seq == 0 {
        return Err(DecodeError::ZeroSequence);
    }
    if size == 0 {
        return Err(DecodeError::ZeroLength);
    }
    if size < prefix_len(timestamped) {
        return Err(DecodeError::Truncated(size));
    }
    if src.len() < size {
        return Ok(None);
    }

    let mut frame = src.split_to(size);
    frame.advance(HEADER_LEN);
    let timestamp = timestamped.then(|| frame.get_f64());
    Ok(Some(Message {
        seq,
        traffic_class,
        timestamp,
        payload: frame.freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(seq: u16, timestamp: Option<f64>, payload: &'static [u8]) -> Message {
        Message {
            seq,
            traffic_class: 0xb8,
            timestamp,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn header_layout() {
        let mut buf = BytesMut::new();
        message(0x0102, None, b"abc").encode(&mut buf);
        assert_eq!(&buf[..], &[0x01, 0x02, 0xb8, 0x00, 0x08, b'a', b'b', b'c']);

        let mut buf = BytesMut::new();
        message(1, Some(1.5), b"").encode(&mut buf);
        assert_eq!(buf.len(), 13);
        assert_eq!(&buf[3..5], &[0x80, 0x0d]);
        assert_eq!(&buf[5..13], &1.5f64.to_be_bytes());
    }

    #[test]
    fn decodes_across_split_reads() {
        let mut wire = BytesMut::new();
        message(1, Some(1700000000.25), b"hello").encode(&mut wire);
        message(2, None, b"world!").encode(&mut wire);

        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in wire.chunks(3) {
            buf.extend_from_slice(chunk);
            while let Some(msg) = decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        assert!(buf.is_empty());
        assert_eq!(
            out,
            vec![
                message(1, Some(1700000000.25), b"hello"),
                message(2, None, b"world!")
            ]
        );
    }

    #[test]
    fn incomplete_header_waits() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        assert_eq!(decode(&mut buf), Ok(None));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn rejects_malformed_headers() {
        let mut buf = BytesMut::from(&[0, 0, 0, 0, 9, 1, 2, 3, 4][..]);
        assert_eq!(decode(&mut buf), Err(DecodeError::ZeroSequence));

        let mut buf = BytesMut::from(&[0, 1, 0, 0x80, 0][..]);
        assert_eq!(decode(&mut buf), Err(DecodeError::ZeroLength));

        // timestamp flag with room for the base header only
        let mut buf = BytesMut::from(&[0, 1, 0, 0x80, 5][..]);
        assert_eq!(decode(&mut buf), Err(DecodeError::Truncated(5)));
    }
}
