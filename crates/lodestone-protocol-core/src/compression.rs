use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read as _, Write as _};
use thiserror::Error;

use crate::codec::{peek_varint, write_varint};

/// Largest uncompressed packet we are willing to inflate (8 MiB).
pub const MAX_UNCOMPRESSED_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Missing or malformed data length")]
    BadDataLength,
    #[error("Declared uncompressed length {0} exceeds the {max} byte limit", max = MAX_UNCOMPRESSED_LEN)]
    TooLarge(usize),
    #[error("Decompressed length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
}

/// Wrap `packet` in the compressed payload format.
///
/// Packets of at least `threshold` bytes are deflated; smaller ones are sent
/// as-is behind a zero data length, as is an empty packet (a zero data length
/// would be ambiguous for it).
pub fn compress(packet: &[u8], threshold: i32) -> BytesMut {
    let mut out = BytesMut::with_capacity(packet.len() + 5);
    if threshold >= 0 && !packet.is_empty() && packet.len() >= threshold as usize {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(packet.len() / 2), Compression::default());
        // Writing into a Vec cannot fail.
        let _ = encoder.write_all(packet);
        let compressed = encoder.finish().unwrap_or_default();
        write_varint(&mut out, packet.len() as i32);
        out.put_slice(&compressed);
    } else {
        write_varint(&mut out, 0);
        out.put_slice(packet);
    }
    out
}

/// Undo [`compress`], returning the packet bytes.
pub fn decompress(payload: &[u8]) -> Result<BytesMut, CompressionError> {
    let (declared, header) = match peek_varint(payload) {
        Ok(Some(decoded)) => decoded,
        _ => return Err(CompressionError::BadDataLength),
    };
    let body = &payload[header..];
    if declared == 0 {
        return Ok(BytesMut::from(body));
    }
    let declared = usize::try_from(declared).map_err(|_| CompressionError::BadDataLength)?;
    if declared > MAX_UNCOMPRESSED_LEN {
        return Err(CompressionError::TooLarge(declared));
    }

    // Read one byte past the declared size so an oversized stream is detected
    // without inflating all of it.
    let mut inflated = Vec::with_capacity(declared);
    ZlibDecoder::new(body)
        .take(declared as u64 + 1)
        .read_to_end(&mut inflated)?;
    if inflated.len() != declared {
        return Err(CompressionError::LengthMismatch {
            declared,
            actual: inflated.len(),
        });
    }
    Ok(BytesMut::from(&inflated[..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_varint;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 7) as u8).collect()
    }

    fn indicator(wire: &BytesMut) -> i32 {
        let mut peek = wire.clone();
        read_varint(&mut peek).unwrap()
    }

    #[test]
    fn test_compression_roundtrip() {
        for threshold in [0, 1, 64, 256, 1024] {
            for len in [0usize, 1, 63, 64, 255, 256, 257, 5000] {
                let packet = payload(len);
                let wire = compress(&packet, threshold);
                assert_eq!(
                    &decompress(&wire).unwrap()[..],
                    &packet[..],
                    "threshold {} len {}",
                    threshold,
                    len
                );
                if len < threshold as usize {
                    assert_eq!(indicator(&wire), 0);
                }
            }
        }
    }

    #[test]
    fn test_threshold_256_small_and_large_packets() {
        let small = payload(100);
        let large = payload(1000);

        let small_wire = compress(&small, 256);
        let large_wire = compress(&large, 256);

        assert_eq!(indicator(&small_wire), 0);
        assert_eq!(indicator(&large_wire), 1000);
        assert!(large_wire.len() < large.len());

        assert_eq!(&decompress(&small_wire).unwrap()[..], &small[..]);
        assert_eq!(&decompress(&large_wire).unwrap()[..], &large[..]);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let mut wire = compress(&payload(1000), 256);
        // Rewrite the declared length (a 2-byte VarInt for 1000) to 999.
        let mut header = BytesMut::new();
        write_varint(&mut header, 999);
        wire[..2].copy_from_slice(&header);
        assert!(matches!(
            decompress(&wire),
            Err(CompressionError::LengthMismatch { declared: 999, actual: 1000 })
        ));
    }

    #[test]
    fn test_oversized_declaration_is_rejected() {
        let mut wire = BytesMut::new();
        write_varint(&mut wire, (MAX_UNCOMPRESSED_LEN + 1) as i32);
        wire.put_slice(&[0x78, 0x9c]);
        assert!(matches!(decompress(&wire), Err(CompressionError::TooLarge(_))));
    }

    #[test]
    fn test_empty_payload_is_malformed() {
        assert!(matches!(decompress(&[]), Err(CompressionError::BadDataLength)));
    }
}
