//! The reconnect loop shared by publishing and subscribing links.
//!
//! A link walks `Disconnected → Connecting → Handshaking → Active` and falls
//! back to `Disconnected` on any failure, pausing according to [`Backoff`]
//! before the next attempt. Only closing the link ends the loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skiff_protocol::{Command, Message, Target};
use skiff_transport::{spawn_supervised, Connection, ConnectionId, MessageWriter, TaskError, TcpConnection, TransportError};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::builder::ClientConfig;
use crate::error::ClientError;

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting to (re)connect.
    Disconnected,
    /// Dialing and exchanging the magic.
    Connecting,
    /// Exchanging `ID` and `PUB`/`SUB`.
    Handshaking,
    /// Carrying messages.
    Active,
    /// Closed for good.
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Handshaking => "handshaking",
            LinkState::Active => "active",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One established connection: a writer plus a background reader whose
/// results arrive over a channel, so receiving is cancel-safe.
pub(crate) struct Link {
    id: ConnectionId,
    writer: MessageWriter<OwnedWriteHalf>,
    incoming: mpsc::Receiver<Result<Message, TransportError>>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Dial, handshake and negotiate `request` (a `PUB` or `SUB`).
    pub(crate) async fn open(config: &ClientConfig, request: &Message, state: &watch::Sender<LinkState>) -> Result<Self, ClientError> {
        state.send_replace(LinkState::Connecting);
        let conn = TcpConnection::connect(config.addr.as_str(), config.handshake_timeout, config.codec.clone()).await?;

        state.send_replace(LinkState::Handshaking);
        let id = conn.id().clone();
        let (mut reader, writer) = conn.into_split();
        let (tx, incoming) = mpsc::channel(16);
        let reader = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(message)) => {
                        if tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let mut link = Self {
            id,
            writer,
            incoming,
            reader,
        };
        if let Some(identity) = &config.identity {
            link.request(&Message::id(identity), config.handshake_timeout).await?;
        }
        link.request(request, config.handshake_timeout).await?;
        Ok(link)
    }

    async fn request(&mut self, message: &Message, timeout: Duration) -> Result<(), ClientError> {
        self.send(message).await?;
        let reply = tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ClientError::from(TransportError::Timeout))??;
        match reply {
            Some(reply) if reply.command() == Command::Ack => Ok(()),
            Some(reply) if reply.command() == Command::Error => Err(ClientError::Rejected(reply.payload_str().into_owned())),
            Some(reply) => Err(ClientError::Unexpected(reply.command())),
            None => Err(TransportError::ConnectionClosed.into()),
        }
    }

    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.writer.send(message).await
    }

    /// Next message from the broker; `None` once it closed the stream.
    /// Cancel-safe.
    pub(crate) async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        self.incoming.recv().await.transpose()
    }

    /// Send `CLOSE` and wait, up to `attempts` times `timeout`, for the
    /// broker's `ACK`. `DATA` arriving in the meantime is returned.
    pub(crate) async fn close(&mut self, attempts: u32, timeout: Duration) -> Result<Vec<Message>, ClientError> {
        self.send(&Message::close()).await?;

        let mut leftover = Vec::new();
        let mut waits = 0;
        while waits < attempts {
            match tokio::time::timeout(timeout, self.recv()).await {
                Ok(Ok(Some(message))) => match message.command() {
                    Command::Ack => {
                        trace!(connection = %self.id, "Close acknowledged");
                        let _ = self.writer.shutdown().await;
                        return Ok(leftover);
                    }
                    Command::Data => leftover.push(message),
                    _ => {}
                },
                Ok(Ok(None)) => return Ok(leftover),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => waits += 1,
            }
        }
        warn!(connection = %self.id, attempts, "Close was not acknowledged");
        Ok(leftover)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// What a link does once it is active.
#[async_trait]
pub(crate) trait LinkDriver: Send + 'static {
    /// Run the link until it fails (`Err`, reconnect) or `shutdown` flips
    /// and the close handshake is done (`Ok`).
    async fn drive(&mut self, link: &mut Link, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError>;

    /// Called once when the loop ends for good.
    fn finish(&mut self) {}
}

async fn run<D>(config: Arc<ClientConfig>, target: Target, request: Message, mut driver: D, state: watch::Sender<LinkState>, mut shutdown: watch::Receiver<bool>)
where
    D: LinkDriver,
{
    let mut backoff = Backoff::new();
    loop {
        if *shutdown.borrow() {
            break;
        }

        let opened = tokio::select! {
            opened = Link::open(&config, &request, &state) => opened,
            _ = shutdown.changed() => break,
        };

        let result = match opened {
            Ok(mut link) => {
                state.send_replace(LinkState::Active);
                if backoff.failures() > 0 {
                    info!(%target, connection = %link.id(), failures = backoff.failures(), "Link re-established");
                } else {
                    debug!(%target, connection = %link.id(), "Link established");
                }
                backoff.reset();
                driver.drive(&mut link, &mut shutdown).await
            }
            Err(e) => Err(e),
        };

        let Err(e) = result else {
            break;
        };
        state.send_replace(LinkState::Disconnected);
        let delay = backoff.fail();
        if backoff.should_log() {
            warn!(%target, addr = %config.addr, failures = backoff.failures(), error = %e, "Link failed, reconnecting");
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    driver.finish();
    state.send_replace(LinkState::Closed);
    debug!(%target, "Link closed");
}

/// Owner's handle on a spawned link task.
#[derive(Debug)]
pub(crate) struct LinkControl {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<LinkState>,
    task: Mutex<Option<JoinHandle<Result<(), TaskError>>>>,
    closed: AtomicBool,
}

impl LinkControl {
    pub(crate) fn spawn<D>(config: Arc<ClientConfig>, target: Target, request: Message, driver: D) -> Self
    where
        D: LinkDriver,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(LinkState::Disconnected);
        let name = format!("link {} {}", request.command(), target);
        let task = spawn_supervised(name, run(config, target, request, driver, state_tx, shutdown_rx));
        Self {
            shutdown,
            state,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub(crate) fn states(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn ready(&self) -> Result<(), ClientError> {
        let mut states = self.states();
        let state = states
            .wait_for(|s| matches!(s, LinkState::Active | LinkState::Closed))
            .await
            .map_err(|_| ClientError::Closed)?;
        if *state == LinkState::Active {
            Ok(())
        } else {
            Err(ClientError::Closed)
        }
    }

    /// Signal the task and wait for it to exit. Every caller returns only
    /// after the task is gone; the teardown itself runs once.
    pub(crate) async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);

        let mut task = self.task.lock().await;
        match task.take() {
            Some(handle) => Ok(handle.await??),
            None => Ok(()),
        }
    }
}

impl Drop for LinkControl {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
