//! The capability to place a message into a queue or topic.

use async_trait::async_trait;
use skiff_protocol::Message;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::retry::Delivery;

/// Anything that accepts messages for one named queue or topic.
///
/// Implemented by local [`Queue`](crate::Queue)s and [`Topic`](crate::Topic)s,
/// and by remote publishing links, so message sources can be written once
/// against this trait.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Name of the destination.
    fn name(&self) -> &str;

    /// Place the message, waiting as long as the destination's policy
    /// allows.
    async fn send(&self, message: Message) -> Result<(), BrokerError>;

    /// Place the message without waiting.
    ///
    /// A full destination is reported as [`BrokerError::QueueFull`] and is
    /// not counted as discarded, so callers can offer the same message
    /// again. A topic hands back the consumers it could not reach as a
    /// [`Delivery::Partial`].
    fn offer(&self, message: Message) -> Result<Delivery, BrokerError>;

    /// Place the message, waiting no later than `deadline`.
    ///
    /// A queue counts a message that misses the deadline as discarded. A
    /// topic does not stop after its first pass: it keeps running retry
    /// rounds until `deadline` and only then hands back a
    /// [`Delivery::Partial`] with the consumers still owed the message, so
    /// the caller can retry or give up on them.
    async fn send_with_deadline(&self, message: Message, deadline: Instant) -> Result<Delivery, BrokerError>;
}
