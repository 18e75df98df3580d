//! Command vocabulary of the Skiff protocol.
//!
//! Every message starts with a single command byte. The byte values are
//! printable ASCII letters so a captured stream stays readable in a hex dump.

use std::fmt;

use crate::codec::ProtocolError;

/// Command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Free-form client identity, sent once after the handshake.
    Id = b'i',
    /// Error reply; the payload is a human-readable reason.
    Error = b'e',
    /// Application data.
    Data = b'd',
    /// Open a publishing link to a queue or topic.
    Pub = b'p',
    /// Open a subscribing link to a queue or topic.
    Sub = b's',
    /// Positive reply to a control message or to `Close`.
    Ack = b'a',
    /// Keepalive, never echoed.
    Noop = b'n',
    /// Request a clean shutdown of the link.
    Close = b'c',
    /// Drop the link immediately without a reply.
    Kill = b'k',
}

impl Command {
    /// The wire byte for this command.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether the command opens or identifies a link.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Command::Id | Command::Pub | Command::Sub)
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Command::Id => "id",
            Command::Error => "error",
            Command::Data => "data",
            Command::Pub => "pub",
            Command::Sub => "sub",
            Command::Ack => "ack",
            Command::Noop => "noop",
            Command::Close => "close",
            Command::Kill => "kill",
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command.as_byte()
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            b'i' => Ok(Command::Id),
            b'e' => Ok(Command::Error),
            b'd' => Ok(Command::Data),
            b'p' => Ok(Command::Pub),
            b's' => Ok(Command::Sub),
            b'a' => Ok(Command::Ack),
            b'n' => Ok(Command::Noop),
            b'c' => Ok(Command::Close),
            b'k' => Ok(Command::Kill),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bytes() {
        let all = [
            Command::Id,
            Command::Error,
            Command::Data,
            Command::Pub,
            Command::Sub,
            Command::Ack,
            Command::Noop,
            Command::Close,
            Command::Kill,
        ];
        for command in all {
            assert_eq!(Command::try_from(command.as_byte()).unwrap(), command);
        }
        assert_eq!(Command::Data.as_byte(), b'd');
        assert_eq!(Command::Kill.as_byte(), b'k');
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Command::try_from(b'x'),
            Err(ProtocolError::UnknownCommand(b'x'))
        ));
    }

    #[test]
    fn test_control_commands() {
        assert!(Command::Pub.is_control());
        assert!(Command::Sub.is_control());
        assert!(Command::Id.is_control());
        assert!(!Command::Data.is_control());
    }
}
