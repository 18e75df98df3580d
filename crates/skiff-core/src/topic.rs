//! Named multicast topic.
//!
//! Every consumer attached to a topic gets its own buffer and receives
//! every message published after it attached. Publishing fans out over a
//! point-in-time snapshot of the consumers with a [`RetrySender`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use skiff_protocol::Message;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::consumer::{Consumer, ConsumerId, ConsumerStats, Counters};
use crate::error::BrokerError;
use crate::producer::Producer;
use crate::retry::{Delivery, RetrySender};

/// Fan-out timing of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Capacity of each consumer buffer.
    pub capacity: usize,
    /// How long a blocking publish keeps retrying slow consumers.
    pub delivery_timeout: Duration,
    /// Pause between retry rounds.
    pub retry_interval: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            delivery_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(10),
        }
    }
}

/// A named broadcast channel.
#[derive(Debug)]
pub struct Topic {
    name: String,
    config: FanoutConfig,
    consumers: RwLock<Vec<Arc<Consumer>>>,
    totals: Arc<Counters>,
    closed: AtomicBool,
}

impl Topic {
    /// Create a topic.
    #[must_use]
    pub fn new(name: impl Into<String>, config: FanoutConfig) -> Self {
        Self {
            name: name.into(),
            config,
            consumers: RwLock::new(Vec::new()),
            totals: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Consumer>>> {
        self.consumers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Consumer>>> {
        self.consumers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fan-out settings.
    #[must_use]
    pub fn config(&self) -> FanoutConfig {
        self.config
    }

    /// Whether the topic was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attach a new consumer. Closing the consumer detaches it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the topic was closed.
    pub fn subscribe(self: &Arc<Self>) -> Result<Arc<Consumer>, BrokerError> {
        let consumer = Arc::new(Consumer::with_totals(
            self.name.clone(),
            self.config.capacity,
            Arc::clone(&self.totals),
        ));
        {
            let mut consumers = self.write();
            if self.is_closed() {
                return Err(BrokerError::Closed(self.name.clone()));
            }
            consumers.push(Arc::clone(&consumer));
        }

        let topic: Weak<Self> = Arc::downgrade(self);
        let id = consumer.id();
        consumer.on_close(move || {
            if let Some(topic) = topic.upgrade() {
                topic.unsubscribe(id);
            }
        });

        trace!(topic = %self.name, consumer = id, "Consumer attached");
        Ok(consumer)
    }

    /// Detach a consumer without closing it. Returns whether it was attached.
    pub fn unsubscribe(&self, id: ConsumerId) -> bool {
        let mut consumers = self.write();
        let before = consumers.len();
        consumers.retain(|c| c.id() != id);
        before != consumers.len()
    }

    /// Consumers attached right now.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Consumer>> {
        self.read().clone()
    }

    /// Number of attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.read().len()
    }

    /// Counters over every consumer the topic ever had; `buffered` covers
    /// the attached ones.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.totals.delivered(),
            discarded: self.totals.discarded(),
            buffered: self.read().iter().map(|c| c.len()).sum(),
        }
    }

    /// Offer the message to every attached consumer, retrying full buffers
    /// until `deadline`.
    ///
    /// Returns [`Delivery::Partial`] when some consumers are still pending
    /// at the deadline; the caller decides whether to keep retrying or close
    /// the sender.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the topic was closed.
    pub async fn send_until(&self, message: &Message, deadline: Instant) -> Result<Delivery, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed(self.name.clone()));
        }

        let mut sender = match RetrySender::first_pass(self.snapshot(), message) {
            Delivery::Complete => return Ok(Delivery::Complete),
            Delivery::Partial(sender) => sender,
        };

        loop {
            tokio::time::sleep_until((Instant::now() + self.config.retry_interval).min(deadline)).await;
            if sender.send_until(message, deadline).await.is_ok() {
                return Ok(Delivery::Complete);
            }
            if Instant::now() >= deadline {
                return Ok(Delivery::Partial(sender));
            }
        }
    }

    /// Publish with the topic's own delivery timeout; consumers still
    /// pending afterwards are counted as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PartialSend`] when some consumers missed the
    /// message, or [`BrokerError::Closed`].
    pub async fn send(&self, message: Message) -> Result<(), BrokerError> {
        let deadline = Instant::now() + self.config.delivery_timeout;
        self.send_until(&message, deadline).await?.into_result()
    }

    /// Close every attached consumer. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Close outside the lock: each consumer's hook detaches itself.
        let consumers = std::mem::take(&mut *self.write());
        let count = consumers.len();
        for consumer in consumers {
            consumer.close();
        }
        debug!(topic = %self.name, consumers = count, "Topic closed");
    }
}

#[async_trait]
impl Producer for Topic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: Message) -> Result<(), BrokerError> {
        Topic::send(self, message).await
    }

    fn offer(&self, message: Message) -> Result<Delivery, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed(self.name.clone()));
        }
        Ok(RetrySender::first_pass(self.snapshot(), &message))
    }

    async fn send_with_deadline(&self, message: Message, deadline: Instant) -> Result<Delivery, BrokerError> {
        self.send_until(&message, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(capacity: usize) -> Arc<Topic> {
        Arc::new(Topic::new(
            "events",
            FanoutConfig {
                capacity,
                delivery_timeout: Duration::from_millis(50),
                retry_interval: Duration::from_millis(5),
            },
        ))
    }

    #[tokio::test]
    async fn test_every_consumer_gets_every_message() {
        let topic = topic(8);
        let a = topic.subscribe().unwrap();
        let b = topic.subscribe().unwrap();

        topic.send(Message::data(b"one")).await.unwrap();
        topic.send(Message::data(b"two")).await.unwrap();

        for consumer in [&a, &b] {
            assert_eq!(consumer.recv().await.unwrap().payload_ref(), b"one");
            assert_eq!(consumer.recv().await.unwrap().payload_ref(), b"two");
        }
    }

    #[tokio::test]
    async fn test_no_consumers_is_complete() {
        let topic = topic(1);
        assert!(topic.send(Message::data(b"void")).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_consumers_are_accounted() {
        let topic = topic(1);
        let consumers: Vec<_> = (0..5).map(|_| topic.subscribe().unwrap()).collect();
        consumers[0].try_send(Message::data(b"filler")).unwrap();
        consumers[2].try_send(Message::data(b"filler")).unwrap();

        let result = topic.send(Message::data(b"payload")).await;
        assert_eq!(result, Err(BrokerError::PartialSend { pending: 2 }));

        let delivered: u64 = consumers.iter().map(|c| c.delivered()).sum::<u64>() - 2;
        let discarded: u64 = consumers.iter().map(|c| c.discarded()).sum();
        assert_eq!(delivered, 3);
        assert_eq!(discarded, 2);
        assert_eq!(delivered + discarded, consumers.len() as u64);
    }

    #[tokio::test]
    async fn test_slow_consumer_catches_up_before_deadline() {
        let topic = topic(1);
        let fast = topic.subscribe().unwrap();
        let slow = topic.subscribe().unwrap();
        slow.try_send(Message::data(b"backlog")).unwrap();

        let drain = {
            let slow = Arc::clone(&slow);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                slow.recv().await
            })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        let delivery = topic.send_until(&Message::data(b"late"), deadline).await.unwrap();
        assert!(delivery.is_complete());

        assert_eq!(drain.await.unwrap().unwrap().payload_ref(), b"backlog");
        assert_eq!(slow.recv().await.unwrap().payload_ref(), b"late");
        assert_eq!(fast.recv().await.unwrap().payload_ref(), b"late");
    }

    #[tokio::test]
    async fn test_partial_delivery_returned_to_caller() {
        let topic = topic(1);
        let stuck = topic.subscribe().unwrap();
        stuck.try_send(Message::data(b"filler")).unwrap();

        let deadline = Instant::now() + Duration::from_millis(20);
        let delivery = topic.send_until(&Message::data(b"m"), deadline).await.unwrap();
        let Delivery::Partial(sender) = delivery else {
            panic!("expected partial delivery");
        };

        assert_eq!(sender.pending(), 1);
        assert_eq!(sender.close(), 1);
        assert_eq!(stuck.discarded(), 1);
    }

    #[tokio::test]
    async fn test_deadline_send_retries_until_deadline() {
        let topic = topic(1);
        let stuck = topic.subscribe().unwrap();
        stuck.try_send(Message::data(b"filler")).unwrap();

        let deadline = Instant::now() + Duration::from_millis(60);
        let delivery = Producer::send_with_deadline(topic.as_ref(), Message::data(b"m"), deadline)
            .await
            .unwrap();

        assert!(Instant::now() >= deadline);
        assert!(!delivery.is_complete());
        assert_eq!(stuck.discarded(), 0);
    }

    #[test]
    fn test_closing_consumer_detaches_it() {
        let topic = topic(4);
        let a = topic.subscribe().unwrap();
        let _b = topic.subscribe().unwrap();
        assert_eq!(topic.consumer_count(), 2);

        a.close();
        assert_eq!(topic.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_stats_survive_detach() {
        let topic = topic(4);
        let a = topic.subscribe().unwrap();
        topic.send(Message::data(b"kept")).await.unwrap();
        assert_eq!(topic.stats().delivered, 1);

        a.close();
        assert_eq!(topic.consumer_count(), 0);
        let stats = topic.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.buffered, 0);
    }

    #[test]
    fn test_close_closes_consumers() {
        let topic = topic(4);
        let a = topic.subscribe().unwrap();
        a.try_send(Message::data(b"pending")).unwrap();

        topic.close();
        topic.close();

        assert!(a.is_closed());
        assert_eq!(a.discarded(), 1);
        assert_eq!(topic.consumer_count(), 0);
        assert!(topic.subscribe().is_err());
    }
}
