use crate::cipher::Cfb8Cipher;
use crate::codec::{read_varint, CodecError};
use crate::compression::{compress, decompress, CompressionError};
use crate::frame::{decode_frame, encode_frame, FrameError, DEFAULT_MAX_FRAME_LEN};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("Bad compressed packet: {0}")]
    Compression(#[from] CompressionError),
    #[error("Bad packet id: {0}")]
    Codec(#[from] CodecError),
    #[error("Encryption is already enabled")]
    EncryptionAlreadyEnabled,
    #[error("Shared secret must be 16 bytes, got {0}")]
    BadSharedSecret(usize),
}

/// A packet pulled off the wire: its ID and undecoded body.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub id: i32,
    pub body: BytesMut,
}

fn secret_key(shared_secret: &[u8]) -> Result<[u8; 16], ConnectionError> {
    shared_secret
        .try_into()
        .map_err(|_| ConnectionError::BadSharedSecret(shared_secret.len()))
}

/// A framed protocol connection with optional compression and encryption.
///
/// The two halves are independent: each owns its own cipher stream and its
/// own copy of the compression threshold, so they can live in one task's
/// `select!` without borrowing each other.
pub struct Connection<R, W> {
    pub reader: ConnectionReader<R>,
    pub writer: ConnectionWriter<W>,
}

impl Connection<OwnedReadHalf, OwnedWriteHalf> {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: ConnectionReader::new(read_half, max_frame_len),
            writer: ConnectionWriter::new(write_half),
        }
    }
}

impl<S: AsyncRead + AsyncWrite> Connection<ReadHalf<S>, WriteHalf<S>> {
    /// Wrap any bidirectional stream (used with in-memory pipes in tests and
    /// by clients).
    pub fn from_stream(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: ConnectionReader::new(read_half, DEFAULT_MAX_FRAME_LEN),
            writer: ConnectionWriter::new(write_half),
        }
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Enable AES-CFB8 encryption in both directions.
    pub fn enable_encryption(&mut self, shared_secret: &[u8]) -> Result<(), ConnectionError> {
        self.reader.enable_encryption(shared_secret)?;
        self.writer.enable_encryption(shared_secret)
    }

    /// Set the compression threshold for both directions (negative disables).
    pub fn set_compression(&mut self, threshold: i32) {
        self.reader.set_compression(threshold);
        self.writer.set_compression(threshold);
    }

    pub async fn read_packet(&mut self) -> Result<Option<RawPacket>, ConnectionError> {
        self.reader.read_packet().await
    }

    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), ConnectionError> {
        self.writer.write_packet(packet).await
    }

    pub fn into_split(self) -> (ConnectionReader<R>, ConnectionWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Read half: decrypt → deframe → decompress.
pub struct ConnectionReader<R> {
    stream: R,
    read_buf: BytesMut,
    max_frame_len: usize,
    compression_threshold: Option<i32>,
    decryptor: Option<Cfb8Cipher>,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    pub fn new(stream: R, max_frame_len: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            max_frame_len,
            compression_threshold: None,
            decryptor: None,
        }
    }

    /// Start decrypting. Bytes already buffered but not yet framed arrived
    /// after the client switched its cipher on, so they are decrypted now.
    pub fn enable_encryption(&mut self, shared_secret: &[u8]) -> Result<(), ConnectionError> {
        if self.decryptor.is_some() {
            return Err(ConnectionError::EncryptionAlreadyEnabled);
        }
        let key = secret_key(shared_secret)?;
        let mut decryptor = Cfb8Cipher::new(&key, &key);
        decryptor.decrypt(&mut self.read_buf);
        self.decryptor = Some(decryptor);
        Ok(())
    }

    pub fn set_compression(&mut self, threshold: i32) {
        self.compression_threshold = (threshold >= 0).then_some(threshold);
    }

    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }

    /// Read the next packet. Returns `Ok(None)` once the peer closes the
    /// stream.
    ///
    /// Cancel safe: the only await point is the socket read, and everything
    /// read is kept in the internal buffer.
    pub async fn read_packet(&mut self) -> Result<Option<RawPacket>, ConnectionError> {
        loop {
            if let Some(packet) = self.next_buffered()? {
                return Ok(Some(packet));
            }
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                return Ok(None);
            }
            let data = &mut tmp[..n];
            if let Some(ref mut decryptor) = self.decryptor {
                decryptor.decrypt(data);
            }
            self.read_buf.extend_from_slice(data);
        }
    }

    /// Pull one complete packet out of the buffer, if there is one.
    pub fn next_buffered(&mut self) -> Result<Option<RawPacket>, ConnectionError> {
        let (packet_len, consumed) = match decode_frame(&self.read_buf, self.max_frame_len)? {
            Some((packet, consumed)) => (packet.len(), consumed),
            None => return Ok(None),
        };
        let mut frame = self.read_buf.split_to(consumed);
        frame.advance(consumed - packet_len);

        let mut packet = match self.compression_threshold {
            Some(_) => decompress(&frame)?,
            None => frame,
        };
        let id = read_varint(&mut packet)?;
        trace!("Read packet id=0x{:02X} len={}", id, packet.len());
        Ok(Some(RawPacket { id, body: packet }))
    }
}

/// Write half: compress → frame → encrypt.
pub struct ConnectionWriter<W> {
    stream: W,
    compression_threshold: Option<i32>,
    encryptor: Option<Cfb8Cipher>,
}

impl<W: AsyncWrite + Unpin> ConnectionWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            compression_threshold: None,
            encryptor: None,
        }
    }

    pub fn enable_encryption(&mut self, shared_secret: &[u8]) -> Result<(), ConnectionError> {
        if self.encryptor.is_some() {
            return Err(ConnectionError::EncryptionAlreadyEnabled);
        }
        let key = secret_key(shared_secret)?;
        self.encryptor = Some(Cfb8Cipher::new(&key, &key));
        Ok(())
    }

    pub fn set_compression(&mut self, threshold: i32) {
        self.compression_threshold = (threshold >= 0).then_some(threshold);
    }

    /// Write one packet (`[VarInt id][body]`) and flush it.
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), ConnectionError> {
        let frame = build_frame(packet, self.compression_threshold, &mut self.encryptor);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn build_frame(
    packet: &[u8],
    compression_threshold: Option<i32>,
    encryptor: &mut Option<Cfb8Cipher>,
) -> BytesMut {
    let mut frame = match compression_threshold {
        Some(threshold) => encode_frame(&compress(packet, threshold)),
        None => encode_frame(packet),
    };
    if let Some(ref mut enc) = encryptor {
        enc.encrypt(&mut frame);
    }
    frame
}
