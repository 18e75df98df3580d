//! Named work queue.
//!
//! A queue owns a single consumer backlog. Every reader attached to the
//! queue takes from that same backlog, so each message reaches exactly one
//! reader and the backlog keeps arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use skiff_protocol::Message;
use tokio::time::Instant;
use tracing::debug;

use crate::consumer::{Consumer, ConsumerStats, TrySendError};
use crate::error::BrokerError;
use crate::producer::Producer;
use crate::retry::Delivery;

/// A named work queue over one shared backlog.
#[derive(Debug)]
pub struct Queue {
    name: String,
    backlog: Arc<Consumer>,
}

impl Queue {
    /// Create a queue whose backlog holds up to `capacity` messages.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        Self {
            backlog: Arc::new(Consumer::new(name.clone(), capacity)),
            name,
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared backlog.
    #[must_use]
    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.backlog
    }

    /// Attach a reader. Readers compete for messages; no fairness between
    /// them is promised.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<Message> {
        self.backlog.receiver()
    }

    /// Enqueue, waiting for room as long as it takes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] once the queue is closed.
    pub async fn send(&self, message: Message) -> Result<(), BrokerError> {
        self.backlog.send(message).await
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueFull`] or [`BrokerError::Closed`].
    pub fn try_send(&self, message: Message) -> Result<(), BrokerError> {
        self.backlog.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::QueueFull,
            TrySendError::Closed(_) => BrokerError::Closed(self.name.clone()),
        })
    }

    /// Enqueue without waiting if possible, otherwise wait until `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Timeout`] (the message is counted as
    /// discarded) or [`BrokerError::Closed`].
    pub async fn send_until(&self, message: Message, deadline: Instant) -> Result<(), BrokerError> {
        self.backlog.send_until(message, deadline).await
    }

    /// Counters of the backlog.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        self.backlog.stats()
    }

    /// Whether the queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.backlog.is_closed()
    }

    /// Close the backlog, discarding whatever is still buffered. Idempotent.
    pub fn close(&self) {
        if self.backlog.close() {
            debug!(queue = %self.name, "Queue closed");
        }
    }
}

#[async_trait]
impl Producer for Queue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: Message) -> Result<(), BrokerError> {
        Queue::send(self, message).await
    }

    fn offer(&self, message: Message) -> Result<Delivery, BrokerError> {
        self.try_send(message)?;
        Ok(Delivery::Complete)
    }

    async fn send_with_deadline(&self, message: Message, deadline: Instant) -> Result<Delivery, BrokerError> {
        self.send_until(message, deadline).await?;
        Ok(Delivery::Complete)
    }
}
