//! Datagram framing.
//!
//! Every datagram carries exactly one message:
//!
//! ```text
//! +----------------+----------------+-------------------+
//! | !size (uint16) | size (uint16)  | payload (size B)  |
//! +----------------+----------------+-------------------+
//! ```
//!
//! The complemented size is only an alignment/corruption check on the header,
//! not a checksum of the payload. Receivers drop anything that fails it.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Bytes of header in front of every payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a frame can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Reasons a datagram is not a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("datagram of {0} bytes is shorter than the frame header")]
    ShortDatagram(usize),

    #[error("size check mismatch: size {size:#06x}, inverted {inverted:#06x}")]
    SizeCheck { size: u16, inverted: u16 },

    #[error("declared payload of {declared} bytes, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload of {0} bytes does not fit in a frame")]
    TooLarge(usize),
}

/// Wrap a payload in a frame header.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let size = u16::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u16(!size);
    frame.put_u16(size);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Validate a received datagram and return its payload.
pub fn decode_frame(datagram: &[u8]) -> Result<&[u8], FrameError> {
    if datagram.len() < FRAME_HEADER_LEN {
        return Err(FrameError::ShortDatagram(datagram.len()));
    }

    let inverted = u16::from_be_bytes([datagram[0], datagram[1]]);
    let size = u16::from_be_bytes([datagram[2], datagram[3]]);
    if inverted != !size {
        return Err(FrameError::SizeCheck { size, inverted });
    }

    let payload = &datagram[FRAME_HEADER_LEN..];
    if payload.len() != size as usize {
        return Err(FrameError::LengthMismatch {
            declared: size as usize,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[0xff, 0xfc, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn valid_frame_yields_payload() {
        let frame = encode_frame(b"hello grid").unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), b"hello grid");
    }

    #[test]
    fn empty_payload() {
        let frame = encode_frame(&[]).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN);
        assert!(decode_frame(&frame).unwrap().is_empty());
    }

    #[test]
    fn short_datagram_rejected() {
        assert_eq!(decode_frame(&[0xff, 0xff, 0x00]), Err(FrameError::ShortDatagram(3)));
        assert_eq!(decode_frame(&[]), Err(FrameError::ShortDatagram(0)));
    }

    #[test]
    fn bad_inverted_size_rejected() {
        let mut frame = encode_frame(b"xy").unwrap().to_vec();
        frame[1] ^= 0x01;
        assert!(matches!(decode_frame(&frame), Err(FrameError::SizeCheck { .. })));
    }

    #[test]
    fn declared_size_beyond_datagram_rejected() {
        let mut frame = encode_frame(b"four").unwrap().to_vec();
        frame.truncate(frame.len() - 1);
        assert_eq!(
            decode_frame(&frame),
            Err(FrameError::LengthMismatch { declared: 4, actual: 3 })
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = encode_frame(b"four").unwrap().to_vec();
        frame.push(0);
        assert!(matches!(decode_frame(&frame), Err(FrameError::LengthMismatch { .. })));
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert_eq!(
            encode_frame(&payload),
            Err(FrameError::TooLarge(MAX_FRAME_PAYLOAD + 1))
        );
        assert!(encode_frame(&payload[..MAX_FRAME_PAYLOAD]).is_ok());
    }
}
