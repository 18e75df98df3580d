//! Transport abstraction traits for Skiff.
//!
//! Brokers and clients exchange [`Message`]s over a [`Connection`]; the
//! session logic does not care which byte stream carries them.

use async_trait::async_trait;
use skiff_core::BrokerError;
use skiff_protocol::{Message, ProtocolError};
use std::fmt;
use thiserror::Error;

use crate::task::TaskError;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The peer answered a control message with ERROR.
    #[error("Rejected by peer: {0}")]
    Rejected(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Broker error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A supervised task panicked.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error means the byte stream is gone (as opposed to the
    /// peer violating the protocol), so reconnecting is the right answer.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            TransportError::ConnectionClosed | TransportError::Timeout | TransportError::Io(_) => true,
            TransportError::Protocol(e) => e.is_transport(),
            _ => false,
        }
    }
}

/// An active message connection.
///
/// Connections carry framed [`Message`]s in both directions between a
/// broker and a single peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next message from the connection.
    ///
    /// Returns `None` if the peer closed the stream on a message boundary.
    async fn recv(&mut self) -> Result<Option<Message>, TransportError>;

    /// Send a message to the connection.
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_transport_classification() {
        assert!(TransportError::ConnectionClosed.is_transport());
        assert!(TransportError::Protocol(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into())).is_transport());
        assert!(!TransportError::Protocol(ProtocolError::LengthNotDigit).is_transport());
        assert!(!TransportError::Rejected("no".into()).is_transport());
    }
}
