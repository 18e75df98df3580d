//! Reconnecting publishing link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use skiff_core::{BrokerError, Delivery, Producer};
use skiff_protocol::{Command, Message, Target};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::builder::ClientConfig;
use crate::error::ClientError;
use crate::link::{Link, LinkControl, LinkDriver, LinkState};

/// A publishing link to one queue or topic.
///
/// Messages go into a bounded buffer and are written by the link task
/// whenever a connection is up. A message whose write failed is written
/// again first after reconnecting. On close, whatever is buffered is
/// flushed before the `CLOSE` handshake if the link is connected; what
/// could not be flushed makes [`close`](Self::close) fail with
/// [`ClientError::Unsent`].
#[derive(Debug)]
pub struct Publisher {
    target: Target,
    tx: flume::Sender<Outbound>,
    unsent: Arc<AtomicUsize>,
    control: LinkControl,
}

/// A buffered message and whoever waits for it to be written.
struct Outbound {
    message: Message,
    written: Option<oneshot::Sender<()>>,
}

impl Outbound {
    fn queued(message: Message) -> Self {
        Self { message, written: None }
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("len", &self.message.payload_len())
            .field("confirmed", &self.written.is_some())
            .finish()
    }
}

impl Publisher {
    pub(crate) fn spawn(config: Arc<ClientConfig>, target: Target) -> Self {
        let (tx, rx) = flume::bounded(config.buffer_capacity);
        let unsent = Arc::new(AtomicUsize::new(0));
        let driver = PublishDriver {
            rx,
            carried: None,
            unsent: Arc::clone(&unsent),
            config: Arc::clone(&config),
        };
        let control = LinkControl::spawn(config, target.clone(), Message::publish(&target), driver);
        Self {
            target,
            tx,
            unsent,
            control,
        }
    }

    /// Destination of this link.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.control.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn states(&self) -> watch::Receiver<LinkState> {
        self.control.states()
    }

    /// Wait until the link is active.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the link closes first.
    pub async fn ready(&self) -> Result<(), ClientError> {
        self.control.ready().await
    }

    /// Messages waiting in the outbound buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.tx.len()
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Queue `message` for sending, waiting while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] once the link is closed.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.tx
            .send_async(Outbound::queued(message))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Queue `message` and wait until the link has written it to the
    /// broker, across reconnects if need be.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] if the link closes before the message
    /// was written.
    pub async fn send_confirmed(&self, message: Message) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let (written, confirmed) = oneshot::channel();
        let outbound = Outbound {
            message,
            written: Some(written),
        };
        self.tx.send_async(outbound).await.map_err(|_| ClientError::Closed)?;

        // A message queued while the task was finishing is never answered.
        let mut states = self.control.states();
        tokio::select! {
            biased;
            written = confirmed => written.map_err(|_| ClientError::Closed),
            _ = states.wait_for(|s| *s == LinkState::Closed) => Err(ClientError::Closed),
        }
    }

    /// Queue `message` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BufferFull`] or [`ClientError::Closed`].
    pub fn try_send(&self, message: Message) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.tx.try_send(Outbound::queued(message)).map_err(|e| match e {
            flume::TrySendError::Full(_) => ClientError::BufferFull,
            flume::TrySendError::Disconnected(_) => ClientError::Closed,
        })
    }

    /// Queue `payload` as `DATA`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] once the link is closed, or a protocol
    /// error for an oversized payload.
    pub async fn publish(&self, payload: impl AsRef<[u8]>) -> Result<(), ClientError> {
        self.send(Message::try_new(Command::Data, payload)?).await
    }

    /// Close the link and wait for its task to finish. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unsent`] if buffered messages could not be
    /// flushed because the link was down, or an error if the link task
    /// panicked.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.control.close().await?;
        match self.unsent.load(Ordering::Acquire) {
            0 => Ok(()),
            dropped => Err(ClientError::Unsent(dropped)),
        }
    }
}

#[async_trait]
impl Producer for Publisher {
    fn name(&self) -> &str {
        &self.target.name
    }

    /// Completes once the message was written to the broker.
    async fn send(&self, message: Message) -> Result<(), BrokerError> {
        self.send_confirmed(message)
            .await
            .map_err(|_| BrokerError::Closed(self.target.name.clone()))
    }

    /// Accepts into the outbound buffer only; the write is not awaited.
    fn offer(&self, message: Message) -> Result<Delivery, BrokerError> {
        match self.try_send(message) {
            Ok(()) => Ok(Delivery::Complete),
            Err(ClientError::BufferFull) => Err(BrokerError::QueueFull),
            Err(_) => Err(BrokerError::Closed(self.target.name.clone())),
        }
    }

    /// A timeout leaves the message buffered; it may still be written.
    async fn send_with_deadline(&self, message: Message, deadline: Instant) -> Result<Delivery, BrokerError> {
        match tokio::time::timeout_at(deadline, self.send_confirmed(message)).await {
            Ok(Ok(())) => Ok(Delivery::Complete),
            Ok(Err(_)) => Err(BrokerError::Closed(self.target.name.clone())),
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

struct PublishDriver {
    rx: flume::Receiver<Outbound>,
    carried: Option<Outbound>,
    unsent: Arc<AtomicUsize>,
    config: Arc<ClientConfig>,
}

impl PublishDriver {
    async fn write(&mut self, link: &mut Link, mut outbound: Outbound) -> Result<(), ClientError> {
        if let Err(e) = link.send(&outbound.message).await {
            self.carried = Some(outbound);
            return Err(e.into());
        }
        if let Some(written) = outbound.written.take() {
            let _ = written.send(());
        }
        Ok(())
    }
}

#[async_trait]
impl LinkDriver for PublishDriver {
    async fn drive(&mut self, link: &mut Link, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
        if let Some(outbound) = self.carried.take() {
            self.write(link, outbound).await?;
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    while let Ok(outbound) = self.rx.try_recv() {
                        self.write(link, outbound).await?;
                    }
                    link.close(self.config.close_attempts, self.config.close_timeout).await?;
                    return Ok(());
                }
                incoming = link.recv() => match incoming? {
                    None => return Err(skiff_transport::TransportError::ConnectionClosed.into()),
                    Some(message) => match message.command() {
                        Command::Error => return Err(ClientError::Rejected(message.payload_str().into_owned())),
                        Command::Ack => return Err(ClientError::UnexpectedAck),
                        other => debug!(connection = %link.id(), command = %other, "Ignoring message on publish link"),
                    },
                },
                outbound = self.rx.recv_async() => match outbound {
                    Ok(outbound) => self.write(link, outbound).await?,
                    Err(_) => return Ok(()),
                },
                () = tokio::time::sleep(self.config.idle_interval) => {
                    link.send(&Message::noop()).await?;
                }
            }
        }
    }

    fn finish(&mut self) {
        // Dropping the waiters tells confirmed senders the write never happened.
        let mut dropped = usize::from(self.carried.take().is_some());
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "Publisher closed with unsent messages");
        }
        self.unsent.store(dropped, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{open_link, stray_ack_server, TestBroker};
    use crate::ClientBuilder;

    #[tokio::test]
    async fn test_publish_to_queue() {
        let server = TestBroker::start().await;
        let publisher = server.client().publisher(Target::queue("orders"));
        publisher.ready().await.unwrap();

        publisher.publish(b"one").await.unwrap();
        publisher.publish(b"two").await.unwrap();
        publisher.close().await.unwrap();
        assert_eq!(publisher.state(), LinkState::Closed);

        let queue = server.broker.queue("orders").unwrap();
        assert_eq!(queue.consumer().recv().await.unwrap().payload_ref(), b"one");
        assert_eq!(queue.consumer().recv().await.unwrap().payload_ref(), b"two");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_buffers_until_broker_appears() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let publisher = ClientBuilder::new(addr.to_string()).publisher(Target::queue("late"));
        publisher.publish(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_ne!(publisher.state(), LinkState::Active);
        assert_eq!(publisher.buffered(), 1);

        let server = TestBroker::start_on(addr).await;
        publisher.ready().await.unwrap();
        let queue = server.broker.create_queue_if_not_exists("late").unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), queue.consumer().recv()).await.unwrap();
        assert_eq!(message.unwrap().payload_ref(), b"early");

        publisher.close().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_target_keeps_retrying() {
        let server = TestBroker::start().await;
        let publisher = server.client().publisher(Target::queue("bad name"));
        let mut states = publisher.states();

        states.wait_for(|s| *s == LinkState::Handshaking).await.unwrap();
        states.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();
        assert!(server.broker.queue_names().is_empty());

        publisher.close().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_concurrent() {
        let server = TestBroker::start().await;
        let publisher = Arc::new(server.client().publisher(Target::topic("events")));
        publisher.ready().await.unwrap();

        let a = tokio::spawn({
            let publisher = Arc::clone(&publisher);
            async move { publisher.close().await }
        });
        let b = tokio::spawn({
            let publisher = Arc::clone(&publisher);
            async move { publisher.close().await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        publisher.close().await.unwrap();

        assert_eq!(publisher.state(), LinkState::Closed);
        assert!(matches!(publisher.publish(b"late").await, Err(ClientError::Closed)));
        assert!(matches!(publisher.try_send(Message::noop()), Err(ClientError::Closed)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_try_send_reports_full_buffer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let publisher = ClientBuilder::new(addr.to_string())
            .buffer_capacity(2)
            .publisher(Target::queue("q"));
        publisher.try_send(Message::data(b"1")).unwrap();
        publisher.try_send(Message::data(b"2")).unwrap();
        assert!(matches!(publisher.try_send(Message::data(b"3")), Err(ClientError::BufferFull)));

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = Producer::send_with_deadline(&publisher, Message::data(b"3"), deadline)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::Timeout);
        assert!(matches!(publisher.close().await, Err(ClientError::Unsent(2))));
    }

    #[tokio::test]
    async fn test_close_while_disconnected_reports_unsent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let publisher = Arc::new(ClientBuilder::new(addr.to_string()).publisher(Target::queue("q")));
        let waiting = tokio::spawn({
            let publisher = Arc::clone(&publisher);
            async move { publisher.send_confirmed(Message::data(b"pending")).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        assert!(matches!(publisher.close().await, Err(ClientError::Unsent(1))));
        assert!(matches!(waiting.await.unwrap(), Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_send_confirmed_waits_for_write() {
        let server = TestBroker::start().await;
        let publisher = server.client().publisher(Target::queue("confirmed"));

        publisher.send_confirmed(Message::data(b"one")).await.unwrap();
        Producer::send(&publisher, Message::data(b"two")).await.unwrap();
        publisher.close().await.unwrap();

        let queue = server.broker.queue("confirmed").unwrap();
        assert_eq!(queue.consumer().recv().await.unwrap().payload_ref(), b"one");
        assert_eq!(queue.consumer().recv().await.unwrap().payload_ref(), b"two");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stray_ack_fails_the_link() {
        let (addr, server) = stray_ack_server().await;
        let config = Arc::new(ClientConfig::new(addr.to_string()));
        let mut link = open_link(&config, &Message::publish(&Target::queue("q"))).await;

        let (_tx, rx) = flume::bounded(4);
        let mut driver = PublishDriver {
            rx,
            carried: None,
            unsent: Arc::new(AtomicUsize::new(0)),
            config,
        };
        let (_stop, mut shutdown) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), driver.drive(&mut link, &mut shutdown))
            .await
            .unwrap();

        assert!(matches!(result, Err(ClientError::UnexpectedAck)));
        drop(link);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_link_sends_noop() {
        let server = TestBroker::start().await;
        let publisher = server
            .client()
            .idle_interval(Duration::from_millis(50))
            .publisher(Target::queue("quiet"));
        publisher.ready().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(publisher.state(), LinkState::Active);
        assert!(server.broker.queue("quiet").unwrap().consumer().is_empty());
        publisher.close().await.unwrap();
        server.stop().await;
    }
}
