//! Reader-side attachment of a link to a queue or topic.

use std::sync::Arc;

use skiff_core::{Broker, BrokerError, Consumer};
use skiff_protocol::{Message, Target, TargetKind};
use tracing::trace;

/// Where a subscribing link takes its messages from.
///
/// A queue attachment reads the queue's shared backlog in competition with
/// every other reader. A topic attachment owns a fresh consumer, which is
/// closed (and detached from the topic) when the attachment is dropped.
#[derive(Debug)]
pub enum Attachment {
    /// Shared queue backlog.
    Backlog {
        /// The queue's backlog.
        consumer: Arc<Consumer>,
        /// This reader's handle on it.
        rx: flume::Receiver<Message>,
    },
    /// Private topic consumer.
    Subscription(Arc<Consumer>),
}

impl Attachment {
    /// Attach to `target`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable name or a closed topic.
    pub fn attach(broker: &Broker, target: &Target) -> Result<Self, BrokerError> {
        match target.kind {
            TargetKind::Queue => {
                let queue = broker.create_queue_if_not_exists(&target.name)?;
                Ok(Attachment::Backlog {
                    consumer: Arc::clone(queue.consumer()),
                    rx: queue.subscribe(),
                })
            }
            TargetKind::Topic => {
                let topic = broker.create_topic_if_not_exists(&target.name)?;
                Ok(Attachment::Subscription(topic.subscribe()?))
            }
        }
    }

    /// The consumer backing this attachment.
    #[must_use]
    pub fn consumer(&self) -> &Arc<Consumer> {
        match self {
            Attachment::Backlog { consumer, .. } | Attachment::Subscription(consumer) => consumer,
        }
    }

    /// Whether the messages come from a shared backlog.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self, Attachment::Backlog { .. })
    }

    /// Next message; `None` once the source is closed and drained.
    /// Cancel-safe.
    pub async fn recv(&self) -> Option<Message> {
        match self {
            Attachment::Backlog { rx, .. } => rx.recv_async().await.ok(),
            Attachment::Subscription(consumer) => consumer.recv().await,
        }
    }

    /// Give back a message that could not be delivered to this reader.
    ///
    /// A backlog message is re-enqueued without waiting so a sibling reader
    /// can pick it up; if that fails, or the source is a private topic
    /// consumer, the message is counted as discarded.
    pub fn requeue(&self, message: Message) {
        if let Attachment::Backlog { consumer, .. } = self {
            if consumer.try_send(message).is_ok() {
                trace!(queue = %consumer.name(), "Message re-enqueued");
                return;
            }
        }
        self.consumer().discard();
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Attachment::Subscription(consumer) = self {
            consumer.close();
        }
    }
}
