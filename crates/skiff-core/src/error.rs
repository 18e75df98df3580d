//! Broker errors.

use thiserror::Error;

/// Errors raised by queues, topics and the registry.
///
/// Every variant is recoverable: callers retry, back off or drop the
/// message, the broker itself keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Non-blocking enqueue found the buffer full.
    #[error("queue full")]
    QueueFull,

    /// The deadline passed before the buffer had room.
    #[error("send timed out")]
    Timeout,

    /// Some topic consumers did not take the message.
    #[error("partial send: {pending} consumers still pending")]
    PartialSend {
        /// Consumers that did not receive the message.
        pending: usize,
    },

    /// The endpoint or consumer was closed.
    #[error("{0} is closed")]
    Closed(String),

    /// The queue/topic name was rejected.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// Offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}
