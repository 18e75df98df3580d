//! Codec for encoding and decoding Skiff messages.
//!
//! Every message is an 8-byte header followed by the payload:
//!
//! ```text
//! byte 0      command
//! byte 1      ' ' (ascii length) | 0x01 (binary length)
//! bytes 2..7  ascii decimal length, space padded     (ascii mode)
//! byte 7      '\n'                                   (ascii mode)
//! bytes 4..8  big-endian u32 length                  (binary mode)
//! ```
//!
//! Payloads up to 65535 bytes use the ascii mode, larger ones (up to
//! 2^31 - 1) the binary mode. Decoders accept both for any length.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;
use crate::message::Message;
use crate::pool::{BufferAlloc, HeapAlloc};

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload encodable in ascii-length mode.
pub const MAX_ASCII_LEN: usize = 65_535;

/// Largest payload encodable at all.
pub const MAX_PAYLOAD_LEN: usize = i32::MAX as usize;

/// Default per-message read limit (64 MiB).
pub const DEFAULT_MAX_READ: usize = 64 * 1024 * 1024;

const ASCII_MODE: u8 = b' ';
const BINARY_MODE: u8 = 1;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer did not open with the expected magic bytes.
    #[error("bad magic number {0:?}")]
    MagicNumber([u8; 4]),

    /// The ascii length field is empty or contains non-digits.
    #[error("length field is not a decimal number")]
    LengthNotDigit,

    /// The declared length does not fit its encoding.
    #[error("length {0} exceeds the limit of its encoding")]
    LengthExceed(usize),

    /// The declared length is above the reader's configured limit.
    #[error("message of {len} bytes exceeds the read limit of {max} bytes")]
    MoreThanMaxRead {
        /// Declared payload length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// A message arrived that is not valid in the current link state.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Unknown command byte.
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    /// Not enough data to decode a message.
    #[error("incomplete message: need {0} more bytes")]
    Incomplete(usize),

    /// A PUB/SUB payload that does not follow `TYPE NAME\n`.
    #[error("invalid control payload: {0}")]
    InvalidControl(String),

    /// The peer did not complete the handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Underlying transport failure, including short reads.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the error comes from the transport rather than from a
    /// protocol violation.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::HandshakeTimeout(_))
    }

    /// Whether the error is an end of stream.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Build the header for a payload of `len` bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::LengthExceed`] if `len` is above [`MAX_PAYLOAD_LEN`].
pub fn encode_header(command: Command, len: usize) -> Result<[u8; HEADER_LEN], ProtocolError> {
    let mut header = [b' '; HEADER_LEN];
    header[0] = command.as_byte();

    if len <= MAX_ASCII_LEN {
        header[1] = ASCII_MODE;
        let mut rest = len;
        let mut pos = 6;
        loop {
            header[pos] = b'0' + (rest % 10) as u8;
            rest /= 10;
            if rest == 0 {
                break;
            }
            pos -= 1;
        }
        header[7] = b'\n';
    } else if len <= MAX_PAYLOAD_LEN {
        header[1] = BINARY_MODE;
        header[2] = 0;
        header[3] = 0;
        header[4..8].copy_from_slice(&(len as u32).to_be_bytes());
    } else {
        return Err(ProtocolError::LengthExceed(len));
    }

    Ok(header)
}

/// Parse a header into its command and payload length.
///
/// # Errors
///
/// Returns an error if the command byte is unknown or the length field is
/// malformed.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(Command, usize), ProtocolError> {
    let command = Command::try_from(header[0])?;

    let len = match header[1] {
        ASCII_MODE => parse_ascii_len(&header[2..7])?,
        BINARY_MODE => {
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            if len > MAX_PAYLOAD_LEN {
                return Err(ProtocolError::LengthExceed(len));
            }
            len
        }
        _ => return Err(ProtocolError::LengthNotDigit),
    };

    Ok((command, len))
}

fn parse_ascii_len(field: &[u8]) -> Result<usize, ProtocolError> {
    let start = field.iter().position(|b| *b != b' ');
    let end = field.iter().rposition(|b| *b != b' ');
    let digits = match (start, end) {
        (Some(start), Some(end)) => &field[start..=end],
        _ => return Err(ProtocolError::LengthNotDigit),
    };

    let mut len = 0usize;
    for b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::LengthNotDigit);
        }
        len = len * 10 + usize::from(b - b'0');
    }

    if len > MAX_ASCII_LEN {
        return Err(ProtocolError::LengthExceed(len));
    }
    Ok(len)
}

fn header_of(data: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&data[..HEADER_LEN]);
    header
}

/// Encode a message to bytes.
///
/// Messages are kept encoded, so this is a reference-counted clone.
#[must_use]
pub fn encode(message: &Message) -> Bytes {
    message.clone().into_bytes()
}

/// Encode a message into an existing buffer.
pub fn encode_into(message: &Message, buf: &mut BytesMut) {
    buf.extend_from_slice(message.as_bytes());
}

/// Decode one message from the front of `data`.
///
/// Trailing bytes after the first message are ignored.
///
/// # Errors
///
/// Returns an error if the data is incomplete or the header is invalid.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::Incomplete(HEADER_LEN - data.len()));
    }

    let (command, len) = parse_header(&header_of(data))?;
    let total = HEADER_LEN + len;
    if data.len() < total {
        return Err(ProtocolError::Incomplete(total - data.len()));
    }

    Ok(Message::from_raw(command, Bytes::copy_from_slice(&data[..total])))
}

/// Try to decode a message from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(message))` if a complete message was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the header is invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    decode_from_limited(buf, MAX_PAYLOAD_LEN)
}

fn decode_from_limited(buf: &mut BytesMut, max: usize) -> Result<Option<Message>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let (command, len) = parse_header(&header_of(buf))?;
    if len > max {
        return Err(ProtocolError::MoreThanMaxRead { len, max });
    }

    let total = HEADER_LEN + len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    Ok(Some(Message::from_raw(command, buf.split_to(total).freeze())))
}

/// Read exactly one message from an async reader.
///
/// A short read at any point is reported as [`ProtocolError::Io`].
///
/// # Errors
///
/// Returns an error on I/O failure, on an invalid header, or if the message is
/// larger than `max_read`.
pub async fn read_message<R>(reader: &mut R, max_read: usize) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_message_with(reader, max_read, &HeapAlloc).await
}

async fn read_message_with<R>(
    reader: &mut R,
    max_read: usize,
    alloc: &dyn BufferAlloc,
) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let (command, len) = parse_header(&header)?;
    if len > max_read {
        return Err(ProtocolError::MoreThanMaxRead { len, max: max_read });
    }

    let mut buf = alloc.alloc(HEADER_LEN + len);
    buf[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut buf[HEADER_LEN..]).await?;

    Ok(Message::from_raw(command, Bytes::from(buf)))
}

/// Write one message to an async writer.
///
/// # Errors
///
/// Returns an error on I/O failure.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(message.as_bytes()).await?;
    Ok(())
}

/// Codec for streaming message encoding/decoding with a read limit and a
/// buffer allocator.
#[derive(Clone)]
pub struct MessageCodec {
    max_read: usize,
    alloc: Arc<dyn BufferAlloc>,
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("max_read", &self.max_read)
            .finish_non_exhaustive()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            max_read: DEFAULT_MAX_READ,
            alloc: Arc::new(HeapAlloc),
        }
    }
}

impl MessageCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the largest payload the codec accepts.
    #[must_use]
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    /// Allocate read buffers from `alloc`.
    #[must_use]
    pub fn with_allocator(mut self, alloc: Arc<dyn BufferAlloc>) -> Self {
        self.alloc = alloc;
        self
    }

    /// The configured read limit.
    #[must_use]
    pub fn max_read(&self) -> usize {
        self.max_read
    }

    /// The allocator read buffers come from.
    #[must_use]
    pub fn allocator(&self) -> &Arc<dyn BufferAlloc> {
        &self.alloc
    }

    /// Encode a message to bytes.
    #[must_use]
    pub fn encode(&self, message: &Message) -> Bytes {
        encode(message)
    }

    /// Decode a message from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails or the message is over the limit.
    pub fn decode(&self, data: &[u8]) -> Result<Message, ProtocolError> {
        if data.len() >= HEADER_LEN {
            let (_, len) = parse_header(&header_of(data))?;
            if len > self.max_read {
                return Err(ProtocolError::MoreThanMaxRead {
                    len,
                    max: self.max_read,
                });
            }
        }
        decode(data)
    }

    /// Try to decode a message from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is invalid or over the limit.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        decode_from_limited(buf, self.max_read)
    }

    /// Read one message from an async reader.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or invalid data.
    pub async fn read<R>(&self, reader: &mut R) -> Result<Message, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        read_message_with(reader, self.max_read, self.alloc.as_ref()).await
    }
}
