//! Reconnecting subscribing link.

use std::sync::Arc;

use async_trait::async_trait;
use skiff_protocol::{Command, Message, Target};
use skiff_transport::{supervised, TransportError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::builder::ClientConfig;
use crate::error::ClientError;
use crate::handler::MessageHandler;
use crate::link::{Link, LinkControl, LinkDriver, LinkState};

/// A subscribing link to one queue or topic.
///
/// Every `DATA` message is passed to the handler on the link task, in
/// arrival order. A handler panic is logged and the message is dropped;
/// the link keeps running.
#[derive(Debug)]
pub struct Subscriber {
    target: Target,
    control: LinkControl,
}

impl Subscriber {
    pub(crate) fn spawn(config: Arc<ClientConfig>, target: Target, handler: Arc<dyn MessageHandler>) -> Self {
        let driver = SubscribeDriver {
            handler,
            target: target.clone(),
            config: Arc::clone(&config),
        };
        let control = LinkControl::spawn(config, target.clone(), Message::subscribe(&target), driver);
        Self { target, control }
    }

    /// Source of this link.
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

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Close the link and wait for its task to finish. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the link task panicked.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.control.close().await
    }
}

struct SubscribeDriver {
    handler: Arc<dyn MessageHandler>,
    target: Target,
    config: Arc<ClientConfig>,
}

impl SubscribeDriver {
    async fn dispatch(&self, message: Message) {
        if supervised("message handler", self.handler.handle(message)).await.is_err() {
            warn!(target = %self.target, "Message dropped by failing handler");
        }
    }
}

#[async_trait]
impl LinkDriver for SubscribeDriver {
    async fn drive(&mut self, link: &mut Link, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    let leftover = link.close(self.config.close_attempts, self.config.close_timeout).await?;
                    for message in leftover {
                        self.dispatch(message).await;
                    }
                    return Ok(());
                }
                incoming = link.recv() => {
                    let Some(message) = incoming? else {
                        return Err(TransportError::ConnectionClosed.into());
                    };
                    match message.command() {
                        Command::Data => self.dispatch(message).await,
                        Command::Noop => {}
                        Command::Ack => return Err(ClientError::UnexpectedAck),
                        Command::Error => return Err(ClientError::Rejected(message.payload_str().into_owned())),
                        other => debug!(connection = %link.id(), command = %other, "Ignoring message on subscribe link"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{collector, open_link, stray_ack_server, TestBroker};

    #[tokio::test]
    async fn test_subscribe_before_queue_exists() {
        let server = TestBroker::start().await;
        let (handler, received) = collector();
        let subscriber = server.client().identity("reader-a").subscriber(Target::queue("abc"), handler);
        subscriber.ready().await.unwrap();
        assert!(server.broker.queue("abc").is_some());

        let publisher = server.client().identity("writer-b").publisher(Target::queue("abc"));
        publisher.publish(b"hello abc").await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), received.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload_ref(), b"hello abc");

        publisher.close().await.unwrap();
        subscriber.close().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_topic_fanout_to_two_subscribers() {
        let server = TestBroker::start().await;
        let (first, first_rx) = collector();
        let (second, second_rx) = collector();
        let a = server.client().subscriber(Target::topic("news"), first);
        let b = server.client().subscriber(Target::topic("news"), second);
        a.ready().await.unwrap();
        b.ready().await.unwrap();

        let topic = server.broker.topic("news").unwrap();
        assert_eq!(topic.consumer_count(), 2);
        for i in 0..3u8 {
            topic.send(Message::data([i])).await.unwrap();
        }

        for rx in [&first_rx, &second_rx] {
            for i in 0..3u8 {
                let message = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(message.payload_ref(), &[i]);
            }
        }

        a.close().await.unwrap();
        b.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(topic.consumer_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_source_removed() {
        let server = TestBroker::start().await;
        let (handler, received) = collector();
        let subscriber = server.client().subscriber(Target::topic("volatile"), handler);
        subscriber.ready().await.unwrap();

        let mut states = subscriber.states();
        assert!(server.broker.remove_topic("volatile"));
        states.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();
        states.wait_for(|s| *s == LinkState::Active).await.unwrap();

        let topic = server.broker.topic("volatile").unwrap();
        topic.send(Message::data(b"after")).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), received.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload_ref(), b"after");

        subscriber.close().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_link() {
        let server = TestBroker::start().await;
        let (tx, rx) = flume::unbounded();
        let subscriber = server.client().subscriber(Target::queue("fragile"), move |message: Message| {
            assert_ne!(message.payload_ref(), b"poison", "poison message");
            let _ = tx.send(message);
        });
        subscriber.ready().await.unwrap();

        let queue = server.broker.queue("fragile").unwrap();
        queue.send(Message::data(b"poison")).await.unwrap();
        queue.send(Message::data(b"fine")).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload_ref(), b"fine");
        assert_eq!(subscriber.state(), LinkState::Active);

        subscriber.close().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stray_ack_fails_the_link() {
        let (addr, server) = stray_ack_server().await;
        let config = Arc::new(ClientConfig::new(addr.to_string()));
        let target = Target::topic("t");
        let mut link = open_link(&config, &Message::subscribe(&target)).await;

        let (handler, received) = collector();
        let mut driver = SubscribeDriver {
            handler: Arc::new(handler),
            target,
            config,
        };
        let (_stop, mut shutdown) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), driver.drive(&mut link, &mut shutdown))
            .await
            .unwrap();

        assert!(matches!(result, Err(ClientError::UnexpectedAck)));
        assert!(received.is_empty());
        drop(link);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice_concurrently() {
        let server = TestBroker::start().await;
        let (handler, _received) = collector();
        let subscriber = server.client().subscriber(Target::queue("twice"), handler);
        subscriber.ready().await.unwrap();

        let (a, b) = tokio::join!(subscriber.close(), subscriber.close());
        a.unwrap();
        b.unwrap();
        assert_eq!(subscriber.state(), LinkState::Closed);
        assert!(subscriber.is_closed());
        server.stop().await;
    }
}
