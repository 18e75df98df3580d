//! Back-pressured fan-out over a snapshot of consumers.
//!
//! A [`RetrySender`] is created for one message and one set of consumers.
//! The first pass tries every consumer without waiting and keeps the ones
//! whose buffer was full. The caller then drives further rounds with
//! [`RetrySender::send_until`] and finally closes the sender, which counts
//! every consumer still pending as discarded. Each consumer is counted
//! exactly once, as delivered or as discarded.

use std::sync::Arc;

use skiff_protocol::Message;
use tokio::time::Instant;
use tracing::trace;

use crate::consumer::{Consumer, TrySendError};
use crate::error::BrokerError;

/// Result of offering a message to a producer.
#[derive(Debug)]
#[must_use = "a partial delivery must be retried or closed"]
pub enum Delivery {
    /// Every consumer took the message.
    Complete,
    /// Some consumers are still pending.
    Partial(RetrySender),
}

impl Delivery {
    /// Whether every consumer took the message.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Delivery::Complete)
    }

    /// Give up on pending consumers.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PartialSend`] with the number of consumers that
    /// were counted as discarded.
    pub fn into_result(self) -> Result<(), BrokerError> {
        match self {
            Delivery::Complete => Ok(()),
            Delivery::Partial(sender) => Err(BrokerError::PartialSend {
                pending: sender.close(),
            }),
        }
    }
}

/// Stateful fan-out cursor over the consumers still owed a message.
#[derive(Debug)]
pub struct RetrySender {
    pending: Vec<Arc<Consumer>>,
    closed: bool,
}

impl RetrySender {
    /// Run the first, non-blocking pass of `message` over `consumers`.
    ///
    /// Consumers that accept are dropped from the list; consumers with a
    /// full buffer are kept in their original order. Closed consumers are
    /// counted as discarded and dropped.
    pub fn first_pass(consumers: Vec<Arc<Consumer>>, message: &Message) -> Delivery {
        let mut pending = consumers;
        pending.retain(|consumer| match consumer.try_send(message.clone()) {
            Ok(()) => false,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => {
                consumer.discard();
                false
            }
        });

        if pending.is_empty() {
            Delivery::Complete
        } else {
            trace!(pending = pending.len(), "Fan-out left consumers pending");
            Delivery::Partial(Self {
                pending,
                closed: false,
            })
        }
    }

    /// Consumers still owed the message.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether every consumer has been served.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run one retry round.
    ///
    /// Pending consumers are tried in order without waiting. If `deadline`
    /// has passed by the time a consumer is reached, that consumer gets
    /// exactly one blocking attempt (send versus deadline) and the round
    /// stops there: it and every consumer after it stay pending unless that
    /// single attempt succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PartialSend`] if consumers remain pending after
    /// the round.
    pub async fn send_until(&mut self, message: &Message, deadline: Instant) -> Result<(), BrokerError> {
        let mut index = 0;
        while index < self.pending.len() {
            if Instant::now() >= deadline {
                let consumer = Arc::clone(&self.pending[index]);
                match tokio::time::timeout_at(deadline, consumer.send(message.clone())).await {
                    Ok(Ok(())) => {
                        self.pending.remove(index);
                    }
                    Ok(Err(_)) => {
                        consumer.discard();
                        self.pending.remove(index);
                    }
                    Err(_) => {}
                }
                break;
            }

            match self.pending[index].try_send(message.clone()) {
                Ok(()) => {
                    self.pending.remove(index);
                }
                Err(TrySendError::Full(_)) => index += 1,
                Err(TrySendError::Closed(_)) => {
                    self.pending.remove(index).discard();
                }
            }
        }

        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::PartialSend {
                pending: self.pending.len(),
            })
        }
    }

    /// Count every pending consumer as discarded and finish. Returns the
    /// number of consumers discarded.
    pub fn close(mut self) -> usize {
        self.discard_pending()
    }

    fn discard_pending(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;

        let count = self.pending.len();
        for consumer in self.pending.drain(..) {
            consumer.discard();
        }
        count
    }
}

impl Drop for RetrySender {
    fn drop(&mut self) {
        self.discard_pending();
    }
}
