//! Broker-side handle for an attached reader.
//!
//! A consumer is a bounded FIFO buffer plus two monotonic counters and a
//! one-shot close hook. Readers take messages from clones of the buffer's
//! receiving end, so several readers attached to one consumer compete for
//! its messages.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use skiff_protocol::Message;
use tokio::time::Instant;
use tracing::debug;

use crate::error::BrokerError;

/// A unique consumer identifier.
pub type ConsumerId = u64;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

type CloseHook = Box<dyn FnOnce() + Send>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a non-blocking enqueue did not happen. The message is handed back.
#[derive(Debug)]
pub enum TrySendError {
    /// The buffer is at capacity.
    Full(Message),
    /// The consumer was closed.
    Closed(Message),
}

impl TrySendError {
    /// Recover the message that was not sent.
    #[must_use]
    pub fn into_inner(self) -> Message {
        match self {
            TrySendError::Full(message) | TrySendError::Closed(message) => message,
        }
    }
}

/// Point-in-time counters of a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Messages accepted into the buffer.
    pub delivered: u64,
    /// Messages given up on: timed out, pending at close, or still buffered
    /// when the consumer closed.
    pub discarded: u64,
    /// Messages currently buffered.
    pub buffered: usize,
}

/// Monotonic delivered/discarded counters.
///
/// Every consumer has its own; a topic also hands one shared instance to
/// all of its consumers so its totals outlive detached consumers.
#[derive(Debug, Default)]
pub struct Counters {
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    /// Messages accepted so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages given up on so far.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Add another set of counts.
    pub(crate) fn absorb(&self, stats: ConsumerStats) {
        self.add_delivered(stats.delivered);
        self.add_discarded(stats.discarded);
    }

    fn add_delivered(&self, n: u64) {
        self.delivered.fetch_add(n, Ordering::Relaxed);
    }

    fn add_discarded(&self, n: u64) {
        self.discarded.fetch_add(n, Ordering::Relaxed);
    }
}

/// A bounded message buffer with delivery accounting.
pub struct Consumer {
    id: ConsumerId,
    name: String,
    capacity: usize,
    sender: Mutex<Option<flume::Sender<Message>>>,
    receiver: flume::Receiver<Message>,
    counters: Counters,
    totals: Option<Arc<Counters>>,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseHook>>,
}

impl Consumer {
    /// Create a consumer buffering up to `capacity` messages.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::build(name.into(), capacity, None)
    }

    /// Create a consumer whose counts are also added to `totals`.
    #[must_use]
    pub fn with_totals(name: impl Into<String>, capacity: usize, totals: Arc<Counters>) -> Self {
        Self::build(name.into(), capacity, Some(totals))
    }

    fn build(name: String, capacity: usize, totals: Option<Arc<Counters>>) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = flume::bounded(capacity);
        Self {
            id: NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed),
            name,
            capacity,
            sender: Mutex::new(Some(sender)),
            receiver,
            counters: Counters::default(),
            totals,
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        }
    }

    /// Install the hook run once on close. If the consumer is already
    /// closed the hook runs immediately.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = lock(&self.on_close);
        if self.is_closed() {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Consumer id.
    #[must_use]
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Name of the queue/topic this consumer belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Whether the consumer was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Messages accepted so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.counters.delivered()
    }

    /// Messages given up on so far.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.counters.discarded()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.delivered(),
            discarded: self.discarded(),
            buffered: self.len(),
        }
    }

    /// Count one message as given up on.
    pub fn discard(&self) {
        self.count_discarded(1);
    }

    fn count_delivered(&self) {
        self.counters.add_delivered(1);
        if let Some(totals) = &self.totals {
            totals.add_delivered(1);
        }
    }

    fn count_discarded(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.counters.add_discarded(n);
        if let Some(totals) = &self.totals {
            totals.add_discarded(n);
        }
    }

    /// Empty the buffer, counting every message taken as discarded.
    fn drain(&self) {
        let mut dropped = 0u64;
        while self.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        self.count_discarded(dropped);
    }

    /// Count an accepted message. One that landed through a sender taken
    /// before `close` ran is drained as discarded like anything else
    /// buffered at close.
    fn landed(&self) {
        self.count_delivered();
        if self.is_closed() {
            self.drain();
        }
    }

    fn sender(&self) -> Option<flume::Sender<Message>> {
        if self.is_closed() {
            return None;
        }
        lock(&self.sender).clone()
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Hands the message back if the buffer is full or the consumer closed.
    pub fn try_send(&self, message: Message) -> Result<(), TrySendError> {
        let Some(sender) = self.sender() else {
            return Err(TrySendError::Closed(message));
        };

        match sender.try_send(message) {
            Ok(()) => {
                self.landed();
                Ok(())
            }
            Err(flume::TrySendError::Full(message)) => Err(TrySendError::Full(message)),
            Err(flume::TrySendError::Disconnected(message)) => Err(TrySendError::Closed(message)),
        }
    }

    /// Enqueue, waiting for room as long as it takes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the consumer is or becomes closed.
    pub async fn send(&self, message: Message) -> Result<(), BrokerError> {
        let Some(sender) = self.sender() else {
            return Err(BrokerError::Closed(self.name.clone()));
        };

        sender
            .send_async(message)
            .await
            .map_err(|_| BrokerError::Closed(self.name.clone()))?;
        self.landed();
        Ok(())
    }

    /// Enqueue without waiting if possible, otherwise wait until `deadline`.
    /// A message that cannot be placed is counted as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Timeout`] once the deadline passes, or
    /// [`BrokerError::Closed`].
    pub async fn send_until(&self, message: Message, deadline: Instant) -> Result<(), BrokerError> {
        let message = match self.try_send(message) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(message)) => message,
            Err(TrySendError::Closed(_)) => {
                self.discard();
                return Err(BrokerError::Closed(self.name.clone()));
            }
        };

        match tokio::time::timeout_at(deadline, self.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.discard();
                Err(e)
            }
            Err(_) => {
                self.discard();
                Err(BrokerError::Timeout)
            }
        }
    }

    /// A receiving end of the buffer. Every clone competes for messages.
    #[must_use]
    pub fn receiver(&self) -> flume::Receiver<Message> {
        self.receiver.clone()
    }

    /// Take the next message, waiting for one. Returns `None` once the
    /// consumer is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        self.receiver.recv_async().await.ok()
    }

    /// Take the next message if one is buffered.
    #[must_use]
    pub fn try_recv(&self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Close the buffer, discard whatever is still in it and run the close
    /// hook. Returns `true` for the call that performed the teardown; every
    /// later or concurrent call returns `false` and does nothing.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        drop(lock(&self.sender).take());

        self.drain();

        let hook = lock(&self.on_close).take();
        if let Some(hook) = hook {
            hook();
        }

        debug!(
            consumer = self.id,
            name = %self.name,
            delivered = self.delivered(),
            discarded = self.discarded(),
            "Consumer closed"
        );
        true
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}
