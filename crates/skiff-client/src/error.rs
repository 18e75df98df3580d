//! Client error types.

use skiff_core::BrokerError;
use skiff_protocol::{Command, ProtocolError};
use skiff_transport::{TaskError, TransportError};
use thiserror::Error;

/// Errors raised by client links, the queue manager and the file relay.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Dial, handshake or socket failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The broker answered a control message with `ERROR`.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// The broker sent `ACK` outside a close handshake.
    #[error("unexpected ACK from broker")]
    UnexpectedAck,

    /// The broker sent a command that makes no sense in the current state.
    #[error("unexpected {0} from broker")]
    Unexpected(Command),

    /// The link, manager or relay has been closed.
    #[error("client closed")]
    Closed,

    /// The link closed while disconnected; this many buffered messages
    /// were never written.
    #[error("{0} buffered messages were not sent")]
    Unsent(usize),

    /// The outbound buffer is full.
    #[error("outbound buffer full")]
    BufferFull,

    /// Local delivery failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Listing request failed.
    #[error("listing request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// File system failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// A background task was cancelled.
    #[error("task cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ClientError {
    /// Whether the error came from the network rather than from the broker
    /// or the caller.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.is_transport(),
            ClientError::Protocol(e) => e.is_transport(),
            ClientError::Http(_) => true,
            _ => false,
        }
    }
}
