//! Client configuration and link construction.

use std::sync::Arc;
use std::time::Duration;

use skiff_protocol::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use skiff_protocol::{MessageCodec, Target};

use crate::handler::MessageHandler;
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;

/// Default outbound buffer capacity of a publishing link.
pub const DEFAULT_BUFFER_CAPACITY: usize = 200;

/// Settings shared by every link a [`ClientBuilder`] spawns.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address, `host:port`.
    pub addr: String,
    /// Identity announced with `ID` after the handshake.
    pub identity: Option<String>,
    /// Outbound buffer capacity of a publishing link.
    pub buffer_capacity: usize,
    /// Bound on the dial, the handshake and each control reply.
    pub handshake_timeout: Duration,
    /// Silence after which a publishing link sends `NOOP`.
    pub idle_interval: Duration,
    /// How many times to wait for the `ACK` to a `CLOSE`.
    pub close_attempts: u32,
    /// How long each of those waits lasts.
    pub close_timeout: Duration,
    /// Codec for incoming messages.
    pub codec: MessageCodec,
}

impl ClientConfig {
    /// Defaults for `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            identity: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_interval: Duration::from_secs(10),
            close_attempts: 5,
            close_timeout: Duration::from_secs(1),
            codec: MessageCodec::new(),
        }
    }
}

/// Builds publishing and subscribing links to one broker.
///
/// ```no_run
/// use skiff_client::ClientBuilder;
/// use skiff_protocol::{Message, Target};
///
/// # async fn demo() -> Result<(), skiff_client::ClientError> {
/// let client = ClientBuilder::new("127.0.0.1:7070").identity("billing");
/// let publisher = client.publisher(Target::queue("invoices"));
/// publisher.publish(b"invoice #1").await?;
/// publisher.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Start from defaults for `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(addr),
        }
    }

    /// Start from a complete configuration.
    #[must_use]
    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Announce `identity` on every link.
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.config.identity = Some(identity.into());
        self
    }

    /// Outbound buffer capacity of publishing links.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    /// Bound on the dial, the handshake and each control reply.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Silence after which a publishing link sends `NOOP`.
    #[must_use]
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.config.idle_interval = interval;
        self
    }

    /// Close handshake: number of waits for the `ACK` and length of each.
    #[must_use]
    pub fn close_handshake(mut self, attempts: u32, timeout: Duration) -> Self {
        self.config.close_attempts = attempts;
        self.config.close_timeout = timeout;
        self
    }

    /// Codec for incoming messages.
    #[must_use]
    pub fn codec(mut self, codec: MessageCodec) -> Self {
        self.config.codec = codec;
        self
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Spawn a publishing link to `target`.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn publisher(&self, target: Target) -> Publisher {
        Publisher::spawn(Arc::new(self.config.clone()), target)
    }

    /// Spawn a subscribing link to `target` feeding `handler`.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn subscriber<H>(&self, target: Target, handler: H) -> Subscriber
    where
        H: MessageHandler,
    {
        self.subscriber_shared(target, Arc::new(handler))
    }

    /// Like [`subscriber`](Self::subscriber) with an already shared handler.
    #[must_use]
    pub fn subscriber_shared(&self, target: Target, handler: Arc<dyn MessageHandler>) -> Subscriber {
        Subscriber::spawn(Arc::new(self.config.clone()), target, handler)
    }
}
