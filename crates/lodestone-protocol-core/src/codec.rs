use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Longest encoding of a 32-bit VarInt.
pub const MAX_VARINT_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("VarInt too big")]
    VarIntTooBig,
    #[error("Not enough data")]
    NotEnoughData,
    #[error("String too long: {0} > {1}")]
    StringTooLong(usize, usize),
    #[error("Byte array too long: {0} > {1}")]
    ArrayTooLong(usize, usize),
    #[error("Negative length: {0}")]
    NegativeLength(i32),
    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,
    #[error("Invalid {0}")]
    Invalid(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Read a VarInt from the buffer.
pub fn read_varint(buf: &mut BytesMut) -> CodecResult<i32> {
    let mut result: i32 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(CodecError::NotEnoughData);
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as i32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 32 {
            return Err(CodecError::VarIntTooBig);
        }
    }
}

/// Decode a VarInt at the start of `data` without consuming anything.
///
/// Returns `Ok(None)` while the encoding is still incomplete, or the value and
/// the number of bytes it occupies.
pub fn peek_varint(data: &[u8]) -> CodecResult<Option<(i32, usize)>> {
    let mut result: i32 = 0;
    for (i, &byte) in data.iter().take(MAX_VARINT_LEN).enumerate() {
        result |= ((byte & 0x7F) as i32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((result, i + 1)));
        }
    }
    if data.len() >= MAX_VARINT_LEN {
        Err(CodecError::VarIntTooBig)
    } else {
        Ok(None)
    }
}

/// Write a VarInt to the buffer.
pub fn write_varint(buf: &mut BytesMut, mut value: i32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value = ((value as u32) >> 7) as i32;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Calculate the byte length of a VarInt.
pub fn varint_len(value: i32) -> usize {
    let mut val = value as u32;
    let mut len = 0;
    loop {
        len += 1;
        val >>= 7;
        if val == 0 {
            break;
        }
    }
    len
}

fn read_len(buf: &mut BytesMut) -> CodecResult<usize> {
    let len = read_varint(buf)?;
    usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
}

/// Read a protocol string (varint-prefixed UTF-8) of at most `max_len` characters.
pub fn read_string(buf: &mut BytesMut, max_len: usize) -> CodecResult<String> {
    let len = read_len(buf)?;
    if len > max_len * 4 {
        return Err(CodecError::StringTooLong(len, max_len));
    }
    if buf.remaining() < len {
        return Err(CodecError::NotEnoughData);
    }
    let bytes = buf.split_to(len);
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
    let chars = s.chars().count();
    if chars > max_len {
        return Err(CodecError::StringTooLong(chars, max_len));
    }
    Ok(s)
}

/// Write a protocol string.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.put_slice(s.as_bytes());
}

/// Read a UUID (128 bits, big endian).
pub fn read_uuid(buf: &mut BytesMut) -> CodecResult<Uuid> {
    if buf.remaining() < 16 {
        return Err(CodecError::NotEnoughData);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

/// Write a UUID.
pub fn write_uuid(buf: &mut BytesMut, uuid: &Uuid) {
    buf.put_slice(uuid.as_bytes());
}

/// Read a byte array with varint length prefix, at most `max_len` bytes.
pub fn read_byte_array(buf: &mut BytesMut, max_len: usize) -> CodecResult<Vec<u8>> {
    let len = read_len(buf)?;
    if len > max_len {
        return Err(CodecError::ArrayTooLong(len, max_len));
    }
    if buf.remaining() < len {
        return Err(CodecError::NotEnoughData);
    }
    let bytes = buf.split_to(len);
    Ok(bytes.to_vec())
}

/// Write a byte array with varint length prefix.
pub fn write_byte_array(buf: &mut BytesMut, data: &[u8]) {
    write_varint(buf, data.len() as i32);
    buf.put_slice(data);
}

pub fn read_u16(buf: &mut BytesMut) -> CodecResult<u16> {
    if buf.remaining() < 2 {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.get_u16())
}

pub fn read_i64(buf: &mut BytesMut) -> CodecResult<i64> {
    if buf.remaining() < 8 {
        return Err(CodecError::NotEnoughData);
    }
    Ok(buf.get_i64())
}

/// Take everything left in the buffer (used for trailing opaque payloads).
pub fn read_remaining(buf: &mut BytesMut) -> Vec<u8> {
    let rest = buf.split();
    rest.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        let test_cases = vec![
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (255, vec![0xFF, 0x01]),
            (25565, vec![0xDD, 0xC7, 0x01]),
            (2097151, vec![0xFF, 0xFF, 0x7F]),
            (-1, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        ];

        for (value, expected_bytes) in test_cases {
            let mut buf = BytesMut::new();
            write_varint(&mut buf, value);
            assert_eq!(
                buf.to_vec(),
                expected_bytes,
                "write_varint({}) failed",
                value
            );

            let mut buf = BytesMut::from(&expected_bytes[..]);
            let result = read_varint(&mut buf).unwrap();
            assert_eq!(result, value, "read_varint for {} failed", value);

            let peeked = peek_varint(&expected_bytes).unwrap();
            assert_eq!(peeked, Some((value, expected_bytes.len())));
        }
    }

    #[test]
    fn test_varint_len() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(25565), 3);
        assert_eq!(varint_len(-1), 5);
    }

    #[test]
    fn test_varint_too_long() {
        let bytes = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(read_varint(&mut buf), Err(CodecError::VarIntTooBig)));
        assert!(matches!(peek_varint(&bytes), Err(CodecError::VarIntTooBig)));
    }

    #[test]
    fn test_peek_varint_incomplete() {
        assert_eq!(peek_varint(&[]).unwrap(), None);
        assert_eq!(peek_varint(&[0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_string_roundtrip() {
        let test_str = "Hello, Minecraft!";
        let mut buf = BytesMut::new();
        write_string(&mut buf, test_str);
        let result = read_string(&mut buf, 32767).unwrap();
        assert_eq!(result, test_str);
    }

    #[test]
    fn test_string_limit_counts_characters() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "SeventeenCharName");
        assert!(matches!(
            read_string(&mut buf, 16),
            Err(CodecError::StringTooLong(17, 16))
        ));
    }

    #[test]
    fn test_uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        let mut buf = BytesMut::new();
        write_uuid(&mut buf, &uuid);
        let result = read_uuid(&mut buf).unwrap();
        assert_eq!(result, uuid);
    }

    #[test]
    fn test_byte_array_limit() {
        let mut buf = BytesMut::new();
        write_byte_array(&mut buf, &[7u8; 300]);
        assert!(matches!(
            read_byte_array(&mut buf, 256),
            Err(CodecError::ArrayTooLong(300, 256))
        ));
    }

    #[test]
    fn test_short_reads_are_errors() {
        let mut buf = BytesMut::from(&[0x01u8][..]);
        assert!(matches!(read_u16(&mut buf), Err(CodecError::NotEnoughData)));
        let mut buf = BytesMut::from(&[0u8; 4][..]);
        assert!(matches!(read_i64(&mut buf), Err(CodecError::NotEnoughData)));
    }
}
