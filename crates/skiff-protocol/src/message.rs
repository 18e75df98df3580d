//! The unit of communication.
//!
//! A [`Message`] keeps its encoded form (header + payload) in one shared
//! buffer. Cloning it for fan-out only bumps a reference count, and writing it
//! to a socket needs no re-encoding.

use std::borrow::Cow;
use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::codec::{encode_header, ProtocolError, HEADER_LEN};
use crate::command::Command;
use crate::control::Target;
use crate::pool::BufferAlloc;

/// An immutable protocol message.
#[derive(Clone)]
pub struct Message {
    command: Command,
    raw: Bytes,
}

impl Message {
    /// Create a message.
    ///
    /// # Panics
    ///
    /// Panics if the payload is longer than `i32::MAX` bytes; use
    /// [`Message::try_new`] for untrusted sizes.
    #[must_use]
    pub fn new(command: Command, payload: impl AsRef<[u8]>) -> Self {
        match Self::try_new(command, payload) {
            Ok(message) => message,
            Err(e) => panic!("cannot build {command} message: {e}"),
        }
    }

    /// Create a message, failing on oversized payloads.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::LengthExceed`] if the payload does not fit
    /// the binary length encoding.
    pub fn try_new(command: Command, payload: impl AsRef<[u8]>) -> Result<Self, ProtocolError> {
        let payload = payload.as_ref();
        let header = encode_header(command, payload.len())?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);

        Ok(Self {
            command,
            raw: buf.freeze(),
        })
    }

    /// Wrap an already framed buffer. `raw` must start with a valid header
    /// for `command` and hold exactly the declared payload.
    pub(crate) fn from_raw(command: Command, raw: Bytes) -> Self {
        debug_assert!(raw.len() >= HEADER_LEN);
        Self { command, raw }
    }

    /// Application data.
    #[must_use]
    pub fn data(payload: impl AsRef<[u8]>) -> Self {
        Self::new(Command::Data, payload)
    }

    /// Client identity.
    #[must_use]
    pub fn id(identity: &str) -> Self {
        Self::new(Command::Id, identity)
    }

    /// Error reply carrying a reason.
    #[must_use]
    pub fn error(reason: &str) -> Self {
        Self::new(Command::Error, reason)
    }

    /// Empty acknowledgment.
    #[must_use]
    pub fn ack() -> Self {
        Self::new(Command::Ack, b"")
    }

    /// Empty keepalive.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Command::Noop, b"")
    }

    /// Clean close request.
    #[must_use]
    pub fn close() -> Self {
        Self::new(Command::Close, b"")
    }

    /// Immediate termination.
    #[must_use]
    pub fn kill() -> Self {
        Self::new(Command::Kill, b"")
    }

    /// Control message opening a publishing link to `target`.
    #[must_use]
    pub fn publish(target: &Target) -> Self {
        Self::new(Command::Pub, target.encode())
    }

    /// Control message opening a subscribing link to `target`.
    #[must_use]
    pub fn subscribe(target: &Target) -> Self {
        Self::new(Command::Sub, target.encode())
    }

    /// The message command.
    #[must_use]
    pub fn command(&self) -> Command {
        self.command
    }

    /// The payload as a shared slice of the underlying buffer.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        self.raw.slice(HEADER_LEN..)
    }

    /// The payload bytes.
    #[must_use]
    pub fn payload_ref(&self) -> &[u8] {
        &self.raw[HEADER_LEN..]
    }

    /// The payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.payload_ref())
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.raw.len() - HEADER_LEN
    }

    /// The full encoded message, header included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Encoded length, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.raw.len()
    }

    /// Consume the message, returning its encoded form.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    /// Parse the payload of a PUB/SUB message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedMessage`] for other commands and
    /// [`ProtocolError::InvalidControl`] for malformed payloads.
    pub fn target(&self) -> Result<Target, ProtocolError> {
        match self.command {
            Command::Pub | Command::Sub => Target::parse(self.payload_ref()),
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "{other} is not a control message"
            ))),
        }
    }

    /// Hand the buffer back to an allocator. Buffers still shared with other
    /// clones are copied out and the copy is recycled instead.
    pub fn recycle(self, alloc: &dyn BufferAlloc) {
        alloc.recycle(Vec::from(self.raw));
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command && self.payload_ref() == other.payload_ref()
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command)
            .field("len", &self.payload_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BytePool;

    #[test]
    fn test_message_creation() {
        let message = Message::data(b"hello");
        assert_eq!(message.command(), Command::Data);
        assert_eq!(message.payload_ref(), b"hello");
        assert_eq!(message.payload_len(), 5);
        assert_eq!(message.encoded_len(), HEADER_LEN + 5);
        assert_eq!(&message.as_bytes()[..HEADER_LEN], b"d     5\n");
    }

    #[test]
    fn test_empty_controls() {
        for message in [Message::ack(), Message::noop(), Message::close(), Message::kill()] {
            assert_eq!(message.payload_len(), 0);
            assert_eq!(message.encoded_len(), HEADER_LEN);
        }
    }

    #[test]
    fn test_control_target() {
        let message = Message::subscribe(&Target::queue("abc"));
        assert_eq!(message.command(), Command::Sub);
        assert_eq!(message.payload_ref(), b"queue abc\n");
        assert_eq!(message.target().unwrap(), Target::queue("abc"));

        assert!(matches!(
            Message::data(b"queue abc\n").target(),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_equality_ignores_header_mode() {
        let ascii = Message::data(b"hi");
        let binary = crate::codec::decode(&[b'd', 1, 0, 0, 0, 0, 0, 2, b'h', b'i']).unwrap();
        assert_eq!(ascii, binary);
        assert_ne!(ascii.as_bytes(), binary.as_bytes());
    }

    #[test]
    fn test_recycle_returns_buffer() {
        let pool = BytePool::new();
        let message = Message::data(vec![7u8; 1000]);
        message.recycle(&pool);
        assert_eq!(pool.stats().recycled, 1);
    }
}
