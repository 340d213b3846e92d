use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::codec::{peek_varint, varint_len, write_varint};

/// Maximum frame length accepted by default (2 MiB, same as vanilla).
pub const DEFAULT_MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame length prefix is longer than 5 bytes")]
    LengthPrefixTooLong,
    #[error("Negative frame length: {0}")]
    NegativeLength(i32),
    #[error("Frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
}

/// Try to decode one frame from the front of `buffered`.
///
/// On success returns the frame's packet bytes and the total number of bytes
/// (prefix included) the frame occupies in `buffered`.
pub fn decode_frame(buffered: &[u8], max_len: usize) -> Result<Option<(&[u8], usize)>, FrameError> {
    let (length, header) = match peek_varint(buffered) {
        Ok(Some(decoded)) => decoded,
        Ok(None) => return Ok(None),
        Err(_) => return Err(FrameError::LengthPrefixTooLong),
    };
    let length = usize::try_from(length).map_err(|_| FrameError::NegativeLength(length))?;
    if length > max_len {
        return Err(FrameError::TooLarge {
            len: length,
            max: max_len,
        });
    }
    let total = header + length;
    if buffered.len() < total {
        return Ok(None);
    }
    Ok(Some((&buffered[header..total], total)))
}

/// Prepend the VarInt length of `packet` and return the complete frame.
pub fn encode_frame(packet: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(varint_len(packet.len() as i32) + packet.len());
    write_varint(&mut frame, packet.len() as i32);
    frame.put_slice(packet);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_frame_roundtrip() {
        for len in [0usize, 1, 127, 128, 300, 16_384, 2_097_151, DEFAULT_MAX_FRAME_LEN] {
            let packet = payload(len);
            let frame = encode_frame(&packet);
            let (decoded, consumed) = decode_frame(&frame, DEFAULT_MAX_FRAME_LEN)
                .unwrap()
                .expect("complete frame");
            assert_eq!(decoded, &packet[..], "payload mismatch for len {}", len);
            assert_eq!(consumed, frame.len());
        }
    }

    #[test]
    fn test_partial_frame_yields_nothing_until_complete() {
        let packet = payload(200);
        let frame = encode_frame(&packet);
        let mut buffered = Vec::new();
        for (i, byte) in frame.iter().enumerate() {
            buffered.push(*byte);
            let result = decode_frame(&buffered, DEFAULT_MAX_FRAME_LEN).unwrap();
            if i + 1 < frame.len() {
                assert!(result.is_none(), "frame decoded early at byte {}", i);
            } else {
                let (decoded, consumed) = result.expect("frame after final byte");
                assert_eq!(decoded, &packet[..]);
                assert_eq!(consumed, frame.len());
            }
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut wire = encode_frame(b"first");
        wire.extend_from_slice(&encode_frame(b"second"));
        let (first, used) = decode_frame(&wire, 64).unwrap().unwrap();
        assert_eq!(first, b"first");
        let (second, _) = decode_frame(&wire[used..], 64).unwrap().unwrap();
        assert_eq!(second, b"second");
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let frame = encode_frame(&payload(65));
        assert!(matches!(
            decode_frame(&frame, 64),
            Err(FrameError::TooLarge { len: 65, max: 64 })
        ));
    }

    #[test]
    fn test_six_byte_prefix_is_rejected() {
        let wire = [0xFFu8, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            decode_frame(&wire, DEFAULT_MAX_FRAME_LEN),
            Err(FrameError::LengthPrefixTooLong)
        ));
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let wire = [0xFFu8, 0xFF, 0xFF, 0xFF, 0x0F];
        assert!(matches!(
            decode_frame(&wire, DEFAULT_MAX_FRAME_LEN),
            Err(FrameError::NegativeLength(-1))
        ));
    }
}
