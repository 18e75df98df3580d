//! Broker-side TCP sessions.
//!
//! Every accepted connection runs one session:
//!
//! 1. handshake (bounded by [`SessionConfig::handshake_timeout`]),
//! 2. control phase: `ID` is acknowledged, the first `PUB`/`SUB` is answered
//!    with `ACK` or `ERROR`,
//! 3. a publish loop (`DATA` into the producer) or a subscribe loop
//!    (messages out of the attachment, `NOOP` when idle), until `CLOSE`,
//!    `KILL`, end of stream or server shutdown.
//!
//! A failure only tears down its own session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skiff_core::{Broker, BrokerError, Producer};
use skiff_protocol::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use skiff_protocol::{Command, Message, MessageCodec, Target};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attach::Attachment;
use crate::task::supervised;
use crate::tcp::TcpConnection;
use crate::traits::{Connection, TransportError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on waiting for the client's magic.
    pub handshake_timeout: Duration,
    /// Silence after which a subscribe link gets a `NOOP`.
    pub idle_interval: Duration,
    /// How long shutdown waits for sessions before aborting them.
    pub shutdown_grace: Duration,
    /// Codec (read limit and buffer allocator) for incoming messages.
    pub codec: MessageCodec,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(1),
            codec: MessageCodec::new(),
        }
    }
}

/// Connection counters, shared with whoever reports them.
#[derive(Debug, Default)]
pub struct SessionStats {
    total: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
}

impl SessionStats {
    /// Sessions ever started.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Sessions running now.
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Sessions that ended with an error.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn open(self: &Arc<Self>) -> ActiveSession {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveSession(Arc::clone(self))
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct ActiveSession(Arc<SessionStats>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer asked to close and got its `ACK`.
    Closed,
    /// The peer sent `KILL`.
    Killed,
    /// The peer went away.
    Disconnected,
    /// The control message was answered with `ERROR`.
    Rejected,
    /// The queue or topic was removed under the link.
    SourceClosed,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionEnd::Closed => "closed",
            SessionEnd::Killed => "killed",
            SessionEnd::Disconnected => "disconnected",
            SessionEnd::Rejected => "rejected",
            SessionEnd::SourceClosed => "source closed",
            SessionEnd::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Outcome of the control phase.
pub enum Negotiated {
    /// `PUB` accepted.
    Publish(Target, Arc<dyn Producer>),
    /// `SUB` accepted.
    Subscribe(Target, Attachment),
    /// The session ended during the control phase.
    Ended(SessionEnd),
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Negotiated::Publish(target, _) => f.debug_tuple("Publish").field(target).finish(),
            Negotiated::Subscribe(target, _) => f.debug_tuple("Subscribe").field(target).finish(),
            Negotiated::Ended(end) => f.debug_tuple("Ended").field(end).finish(),
        }
    }
}

/// Run the control phase on a handshaken connection.
///
/// Every control message gets exactly one reply.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn negotiate<C>(conn: &mut C, broker: &Broker) -> Result<Negotiated, TransportError>
where
    C: Connection + ?Sized,
{
    loop {
        let Some(message) = conn.recv().await? else {
            return Ok(Negotiated::Ended(SessionEnd::Disconnected));
        };

        match message.command() {
            Command::Id => {
                debug!(connection = %conn.id(), identity = %message.payload_str(), "Client identified");
                conn.send(&Message::ack()).await?;
            }
            command @ (Command::Pub | Command::Sub) => {
                let target = match message.target() {
                    Ok(target) => target,
                    Err(e) => {
                        conn.send(&Message::error(&e.to_string())).await?;
                        return Ok(Negotiated::Ended(SessionEnd::Rejected));
                    }
                };

                let negotiated = if command == Command::Pub {
                    broker.producer(&target).map(|p| Negotiated::Publish(target.clone(), p))
                } else {
                    Attachment::attach(broker, &target).map(|a| Negotiated::Subscribe(target.clone(), a))
                };

                return match negotiated {
                    Ok(negotiated) => {
                        conn.send(&Message::ack()).await?;
                        debug!(connection = %conn.id(), %command, %target, "Link established");
                        Ok(negotiated)
                    }
                    Err(e) => {
                        conn.send(&Message::error(&e.to_string())).await?;
                        Ok(Negotiated::Ended(SessionEnd::Rejected))
                    }
                };
            }
            Command::Noop => {}
            Command::Close => {
                conn.send(&Message::ack()).await?;
                return Ok(Negotiated::Ended(SessionEnd::Closed));
            }
            Command::Kill => return Ok(Negotiated::Ended(SessionEnd::Killed)),
            other => {
                conn.send(&Message::error(&format!("unexpected {other} before PUB/SUB"))).await?;
                return Ok(Negotiated::Ended(SessionEnd::Rejected));
            }
        }
    }
}

/// Publish loop: forward `DATA` into `producer` until the peer stops.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn publish<C>(conn: &mut C, target: &Target, producer: &dyn Producer) -> Result<SessionEnd, TransportError>
where
    C: Connection + ?Sized,
{
    loop {
        let Some(message) = conn.recv().await? else {
            return Ok(SessionEnd::Disconnected);
        };

        match message.command() {
            Command::Data => match producer.send(message).await {
                Ok(()) => {}
                Err(e @ BrokerError::Closed(_)) => {
                    conn.send(&Message::error(&e.to_string())).await?;
                    return Ok(SessionEnd::SourceClosed);
                }
                Err(e) => debug!(%target, error = %e, "Publish incomplete"),
            },
            Command::Noop => {}
            Command::Close => {
                conn.send(&Message::ack()).await?;
                return Ok(SessionEnd::Closed);
            }
            Command::Kill => return Ok(SessionEnd::Killed),
            other => warn!(%target, command = %other, "Ignoring message on publish link"),
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Subscribe loop: write messages from `attachment` to the peer.
///
/// A background reader watches for `CLOSE`/`KILL`/end of stream while the
/// writer drains the attachment and sends `NOOP` after `idle_interval` of
/// silence. A message whose write fails is handed back to the attachment.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn subscribe(conn: TcpConnection, target: &Target, attachment: Attachment, idle_interval: Duration) -> Result<SessionEnd, TransportError> {
    let alloc = Arc::clone(conn.codec().allocator());
    let (mut reader, mut writer) = conn.into_split();

    let (event_tx, mut event_rx) = oneshot::channel::<Result<SessionEnd, TransportError>>();
    let link = target.clone();
    let _reader = AbortOnDrop(tokio::spawn(async move {
        let end = loop {
            match reader.recv().await {
                Ok(Some(message)) => match message.command() {
                    Command::Close => break Ok(SessionEnd::Closed),
                    Command::Kill => break Ok(SessionEnd::Killed),
                    Command::Noop => {}
                    other => debug!(target = %link, command = %other, "Ignoring message on subscribe link"),
                },
                Ok(None) => break Ok(SessionEnd::Disconnected),
                Err(e) => break Err(e),
            }
        };
        let _ = event_tx.send(end);
    }));

    let idle = tokio::time::sleep(idle_interval);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            event = &mut event_rx => {
                let end = event.unwrap_or(Ok(SessionEnd::Disconnected))?;
                if end == SessionEnd::Closed {
                    writer.send(&Message::ack()).await?;
                }
                return Ok(end);
            }
            message = attachment.recv() => {
                let Some(message) = message else {
                    return Ok(SessionEnd::SourceClosed);
                };
                if let Err(e) = writer.send(&message).await {
                    attachment.requeue(message);
                    return Err(e);
                }
                if attachment.is_shared() {
                    message.recycle(alloc.as_ref());
                }
                idle.as_mut().reset(Instant::now() + idle_interval);
            }
            () = &mut idle => {
                writer.send(&Message::noop()).await?;
                idle.as_mut().reset(Instant::now() + idle_interval);
            }
        }
    }
}

/// Serve one accepted TCP stream until it ends.
///
/// # Errors
///
/// Returns an error if the handshake or the connection fails.
pub async fn serve_connection(
    stream: TcpStream,
    broker: &Broker,
    config: &SessionConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionEnd, TransportError> {
    let mut conn = TcpConnection::accept(stream, config.handshake_timeout, config.codec.clone()).await?;
    let id = conn.id().clone();
    let remote = conn.remote_addr().unwrap_or_default();

    let run = async {
        match negotiate(&mut conn, broker).await? {
            Negotiated::Publish(target, producer) => publish(&mut conn, &target, producer.as_ref()).await,
            Negotiated::Subscribe(target, attachment) => subscribe(conn, &target, attachment, config.idle_interval).await,
            Negotiated::Ended(end) => Ok(end),
        }
    };

    let end = tokio::select! {
        end = run => end?,
        _ = shutdown.changed() => SessionEnd::Shutdown,
    };
    debug!(connection = %id, %remote, %end, "Session ended");
    Ok(end)
}

/// Accepts broker connections and runs their sessions.
#[derive(Debug, Clone)]
pub struct SessionServer {
    broker: Arc<Broker>,
    config: SessionConfig,
    stats: Arc<SessionStats>,
}

impl SessionServer {
    /// Create a server over `broker`.
    #[must_use]
    pub fn new(broker: Arc<Broker>, config: SessionConfig) -> Self {
        Self {
            broker,
            config,
            stats: Arc::new(SessionStats::default()),
        }
    }

    /// Shared connection counters.
    #[must_use]
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` flips, then wait (up to the
    /// configured grace period) for running sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener address cannot be read.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let local: SocketAddr = listener.local_addr()?;
        info!("Broker listening on {}", local);

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted TCP connection from {}", addr);
                        let broker = Arc::clone(&self.broker);
                        let config = self.config.clone();
                        let stats = Arc::clone(&self.stats);
                        let shutdown = shutdown.clone();
                        sessions.spawn(supervised("session", async move {
                            let _active = stats.open();
                            if let Err(e) = serve_connection(stream, &broker, &config, shutdown).await {
                                stats.record_failure();
                                if e.is_transport() {
                                    debug!(%addr, error = %e, "Session dropped");
                                } else {
                                    warn!(%addr, error = %e, "Session failed");
                                }
                            }
                        }));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(sessions = sessions.len(), "Broker listener shutting down");
        let drain = async { while sessions.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            sessions.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_protocol::handshake::handshake;
    use tokio::io::AsyncReadExt;

    struct Harness {
        addr: SocketAddr,
        broker: Arc<Broker>,
        stats: Arc<SessionStats>,
        shutdown: watch::Sender<bool>,
        server: JoinHandle<Result<(), TransportError>>,
    }

    async fn start(config: SessionConfig) -> Harness {
        let broker = Arc::new(Broker::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let server = SessionServer::new(Arc::clone(&broker), config);
        let stats = server.stats();
        let server = tokio::spawn(async move { server.serve(listener, rx).await });
        Harness {
            addr,
            broker,
            stats,
            shutdown,
            server,
        }
    }

    async fn link(addr: SocketAddr, control: Message) -> TcpConnection {
        let mut conn = TcpConnection::connect(addr, Duration::from_secs(1), MessageCodec::new())
            .await
            .unwrap();
        conn.send(&control).await.unwrap();
        let reply = conn.recv().await.unwrap().unwrap();
        assert_eq!(reply.command(), Command::Ack, "reply {:?}", reply);
        conn
    }

    #[tokio::test]
    async fn test_subscribe_before_queue_exists() {
        let h = start(SessionConfig::default()).await;

        let mut sub = link(h.addr, Message::subscribe(&Target::queue("abc"))).await;
        assert!(h.broker.queue("abc").is_some());

        let mut publisher = link(h.addr, Message::publish(&Target::queue("abc"))).await;
        publisher.send(&Message::data(b"hello")).await.unwrap();

        let received = sub.recv().await.unwrap().unwrap();
        assert_eq!(received, Message::data(b"hello"));

        h.shutdown.send(true).unwrap();
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_identity_then_topic_fanout() {
        let h = start(SessionConfig::default()).await;

        let mut a = TcpConnection::connect(h.addr, Duration::from_secs(1), MessageCodec::new())
            .await
            .unwrap();
        a.send(&Message::id("reader-a")).await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap().command(), Command::Ack);
        a.send(&Message::subscribe(&Target::topic("news"))).await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap().command(), Command::Ack);

        let mut b = link(h.addr, Message::subscribe(&Target::topic("news"))).await;
        let mut publisher = link(h.addr, Message::publish(&Target::topic("news"))).await;
        publisher.send(&Message::data(b"extra")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().unwrap().payload_ref(), b"extra");
        assert_eq!(b.recv().await.unwrap().unwrap().payload_ref(), b"extra");
    }

    #[tokio::test]
    async fn test_bad_control_gets_error() {
        let h = start(SessionConfig::default()).await;
        let mut conn = TcpConnection::connect(h.addr, Duration::from_secs(1), MessageCodec::new())
            .await
            .unwrap();

        conn.send(&Message::new(Command::Sub, b"bucket x\n")).await.unwrap();
        let reply = conn.recv().await.unwrap().unwrap();
        assert_eq!(reply.command(), Command::Error);
        assert!(reply.payload_str().contains("bucket"));
        assert!(conn.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_data_before_control_is_rejected() {
        let h = start(SessionConfig::default()).await;
        let mut conn = TcpConnection::connect(h.addr, Duration::from_secs(1), MessageCodec::new())
            .await
            .unwrap();

        conn.send(&Message::data(b"too early")).await.unwrap();
        assert_eq!(conn.recv().await.unwrap().unwrap().command(), Command::Error);
    }

    #[tokio::test]
    async fn test_close_handshake_on_both_links() {
        let h = start(SessionConfig::default()).await;

        let mut sub = link(h.addr, Message::subscribe(&Target::topic("t"))).await;
        sub.send(&Message::close()).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().unwrap().command(), Command::Ack);

        let mut publisher = link(h.addr, Message::publish(&Target::queue("q"))).await;
        publisher.send(&Message::close()).await.unwrap();
        assert_eq!(publisher.recv().await.unwrap().unwrap().command(), Command::Ack);

        // The topic consumer is detached once its session ends.
        for _ in 0..50 {
            if h.broker.topic("t").unwrap().consumer_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.broker.topic("t").unwrap().consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_subscriber_gets_noop() {
        let h = start(SessionConfig {
            idle_interval: Duration::from_millis(50),
            ..SessionConfig::default()
        })
        .await;

        let mut sub = link(h.addr, Message::subscribe(&Target::queue("quiet"))).await;
        let noop = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(noop.command(), Command::Noop);
        assert_eq!(noop.payload_len(), 0);
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let h = start(SessionConfig {
            handshake_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        })
        .await;

        let mut stream = TcpStream::connect(h.addr).await.unwrap();
        let mut magic = [0u8; 4];
        stream.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"aav1");

        // Never answer; the server gives up and closes.
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
        assert!(read.is_ok());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.stats.failed(), 1);
        assert_eq!(h.stats.active(), 0);
    }

    #[tokio::test]
    async fn test_queue_readers_compete() {
        let h = start(SessionConfig::default()).await;
        let readers: Vec<_> = [
            link(h.addr, Message::subscribe(&Target::queue("work"))).await,
            link(h.addr, Message::subscribe(&Target::queue("work"))).await,
        ]
        .into_iter()
        .map(|mut conn| {
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(Ok(Some(message))) =
                    tokio::time::timeout(Duration::from_millis(300), conn.recv()).await
                {
                    seen.push(message.payload_ref()[0]);
                }
                seen
            })
        })
        .collect();

        let queue = h.broker.queue("work").unwrap();
        for i in 0..20u8 {
            queue.send(Message::data([i])).await.unwrap();
        }

        let mut seen = Vec::new();
        for reader in readers {
            seen.extend(reader.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_shutdown_ends_sessions() {
        let h = start(SessionConfig::default()).await;
        let mut sub = link(h.addr, Message::subscribe(&Target::topic("t"))).await;

        h.shutdown.send(true).unwrap();
        h.server.await.unwrap().unwrap();
        assert!(sub.recv().await.map(|m| m.is_none()).unwrap_or(true));
    }

    #[tokio::test]
    async fn test_raw_handshake_helper_is_compatible() {
        let h = start(SessionConfig::default()).await;
        let mut stream = TcpStream::connect(h.addr).await.unwrap();
        handshake(&mut stream, Some(Duration::from_secs(1))).await.unwrap();
    }
}
