//! WebSocket gateway.
//!
//! Bridges one WebSocket connection to one queue or topic, addressed by the
//! request path `/mq/{queue|topic}/{name}`. Two independent directions run
//! side by side:
//!
//! - outbound: messages taken from the attachment are sent as binary frames;
//! - inbound: every binary or text frame becomes a `DATA` message for the
//!   producer.
//!
//! Either direction ending (end of stream, closed connection, shutdown)
//! stops the other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use skiff_core::{Broker, BrokerError, Delivery, Producer, RetrySender};
use skiff_protocol::{Message, Target, TargetKind};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::accept_hdr_async_with_config;
use tracing::{debug, info, trace, warn};

use crate::attach::Attachment;
use crate::session::SessionStats;
use crate::task::supervised;
use crate::traits::TransportError;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Spacing of inbound delivery tries.
    pub retry_tick: Duration,
    /// Inbound delivery tries before a frame is dropped.
    pub tries: usize,
    /// Maximum accepted frame size in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for connections before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry_tick: Duration::from_millis(100),
            tries: 2,
            max_message_size: 64 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Parse a gateway request path: `/mq/queue/NAME` or `/mq/topic/NAME`.
#[must_use]
pub fn parse_path(path: &str) -> Option<Target> {
    let rest = path.strip_prefix("/mq/")?;
    let (kind, name) = rest.split_once('/')?;
    let kind: TargetKind = kind.parse().ok()?;
    skiff_protocol::validate_name(name).ok()?;
    Some(Target::new(kind, name))
}

/// Whether a WebSocket error just means the peer is gone.
#[must_use]
pub fn is_closed_error(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        WsError::Protocol(tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake) => true,
        _ => false,
    }
}

fn ws_error(err: WsError) -> TransportError {
    if is_closed_error(&err) {
        TransportError::ConnectionClosed
    } else {
        TransportError::WebSocket(err.to_string())
    }
}

/// Outbound direction: attachment to socket.
async fn outbound<S>(
    mut sink: S,
    attachment: &Attachment,
    target: &Target,
    mut stop: watch::Receiver<bool>,
) -> Result<(), TransportError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    loop {
        let message = tokio::select! {
            message = attachment.recv() => message,
            _ = stop.changed() => break,
        };
        let Some(message) = message else {
            debug!(%target, "Gateway source closed");
            break;
        };

        if let Err(e) = sink.send(WsMessage::Binary(message.payload_ref().to_vec())).await {
            // One best-effort chance for a sibling reader.
            attachment.requeue(message);
            return match ws_error(e) {
                TransportError::ConnectionClosed => Ok(()),
                other => Err(other),
            };
        }
    }

    let _ = sink.close().await;
    Ok(())
}

/// Deliver one inbound message with a bounded number of tries, one per
/// `retry_tick`.
///
/// Every try but the last only offers the message, so a full destination
/// costs nothing but the wait. The last try waits until the end of its
/// tick and settles the accounting: a queue counts one discard, pending
/// topic consumers are closed out once each.
///
/// Returns `false` if the message was dropped.
async fn deliver(producer: &dyn Producer, message: Message, config: &GatewayConfig) -> Result<bool, BrokerError> {
    let tries = config.tries.max(1);
    let mut pending: Option<RetrySender> = None;

    for attempt in 1..=tries {
        let tick = Instant::now() + config.retry_tick;

        if attempt == tries {
            let delivery = match pending.take() {
                Some(mut sender) => {
                    let mut served = sender.send_until(&message, tick).await.is_ok();
                    if !served {
                        tokio::time::sleep_until(tick).await;
                        served = sender.send_until(&message, Instant::now() + config.retry_tick).await.is_ok();
                    }
                    if served {
                        Delivery::Complete
                    } else {
                        Delivery::Partial(sender)
                    }
                }
                None => match producer.send_with_deadline(message.clone(), tick).await {
                    Ok(delivery) => delivery,
                    Err(BrokerError::Timeout | BrokerError::QueueFull) => return Ok(false),
                    Err(e) => return Err(e),
                },
            };
            return Ok(match delivery {
                Delivery::Complete => true,
                Delivery::Partial(sender) => {
                    sender.close();
                    false
                }
            });
        }

        let done = match pending.as_mut() {
            Some(sender) => sender.send_until(&message, tick).await.is_ok(),
            None => match producer.offer(message.clone()) {
                Ok(Delivery::Complete) => true,
                Ok(Delivery::Partial(sender)) => {
                    pending = Some(sender);
                    false
                }
                Err(BrokerError::QueueFull) => false,
                Err(e) => return Err(e),
            },
        };
        if done {
            return Ok(true);
        }
        tokio::time::sleep_until(tick).await;
    }

    Ok(false)
}

/// Inbound direction: socket to producer.
async fn inbound<S>(
    mut stream: S,
    producer: &dyn Producer,
    target: &Target,
    config: &GatewayConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<(), TransportError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = stop.changed() => return Ok(()),
        };

        let payload = match frame {
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) if is_closed_error(&e) => return Ok(()),
            Some(Err(e)) => return Err(ws_error(e)),
        };

        let message = Message::try_new(skiff_protocol::Command::Data, payload)?;
        if !deliver(producer, message, config).await? {
            warn!(%target, "Gateway inbound overflow, message dropped");
        } else {
            trace!(%target, "Gateway message delivered");
        }
    }
}

/// Bridge an upgraded WebSocket to `target` until either side stops or
/// `shutdown` flips.
///
/// # Errors
///
/// Returns an error for a WebSocket failure other than the peer going away,
/// or if the target cannot be attached.
pub async fn bridge<S>(
    ws: S,
    broker: &Broker,
    target: &Target,
    config: &GatewayConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    let attachment = Attachment::attach(broker, target)?;
    let producer: Arc<dyn Producer> = broker.producer(target)?;
    let (sink, stream) = ws.split();

    let (stop_tx, stop_rx) = watch::channel(false);
    let out = async {
        let result = outbound(sink, &attachment, target, stop_rx.clone()).await;
        let _ = stop_tx.send(true);
        result
    };
    let inn = async {
        let result = inbound(stream, producer.as_ref(), target, config, stop_rx.clone()).await;
        let _ = stop_tx.send(true);
        result
    };
    let both = async { tokio::join!(out, inn) };
    tokio::pin!(both);

    let (out, inn) = tokio::select! {
        results = &mut both => results,
        _ = shutdown.changed() => {
            let _ = stop_tx.send(true);
            both.await
        }
    };
    out.and(inn)
}

/// Accepts WebSocket connections and bridges each one.
#[derive(Debug, Clone)]
pub struct Gateway {
    broker: Arc<Broker>,
    config: GatewayConfig,
    stats: Arc<SessionStats>,
}

impl Gateway {
    /// Create a gateway over `broker`.
    #[must_use]
    pub fn new(broker: Arc<Broker>, config: GatewayConfig) -> Self {
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

    async fn handle(&self, stream: TcpStream, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut target = None;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        let ws = accept_hdr_async_with_config(
            stream,
            |request: &Request, response: Response| match parse_path(request.uri().path()) {
                Some(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                None => {
                    let mut error = ErrorResponse::new(Some("expected /mq/{queue|topic}/{name}".to_string()));
                    *error.status_mut() = StatusCode::NOT_FOUND;
                    Err(error)
                }
            },
            Some(ws_config),
        )
        .await
        .map_err(|e| TransportError::WebSocket(format!("WebSocket handshake failed: {e}")))?;

        let target = target.ok_or_else(|| TransportError::Other("missing gateway target".into()))?;
        debug!(%addr, %target, "WebSocket gateway connected");
        bridge(ws, &self.broker, &target, &self.config, shutdown).await
    }

    /// Accept connections until `shutdown` flips.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener address cannot be read.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        info!("WebSocket gateway listening on {}", listener.local_addr()?);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let gateway = self.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(supervised("gateway", async move {
                            let _active = gateway.stats.open();
                            if let Err(e) = gateway.handle(stream, addr, shutdown).await {
                                gateway.stats.record_failure();
                                warn!(%addr, error = %e, "Gateway connection failed");
                            }
                        }));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(connections = connections.len(), "WebSocket gateway shutting down");
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            connections.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("/mq/queue/jobs"), Some(Target::queue("jobs")));
        assert_eq!(parse_path("/mq/topic/news"), Some(Target::topic("news")));
        assert_eq!(parse_path("/mq/bucket/x"), None);
        assert_eq!(parse_path("/mq/queue/"), None);
        assert_eq!(parse_path("/other/queue/x"), None);
        assert_eq!(parse_path("/mq/queue/a/b"), None);
    }

    #[test]
    fn test_closed_errors() {
        assert!(is_closed_error(&WsError::ConnectionClosed));
        assert!(is_closed_error(&WsError::AlreadyClosed));
        assert!(is_closed_error(&WsError::Io(std::io::ErrorKind::ConnectionReset.into())));
        assert!(!is_closed_error(&WsError::Protocol(
            tokio_tungstenite::tungstenite::error::ProtocolError::HandshakeIncomplete
        )));
    }

    fn retry_config() -> GatewayConfig {
        GatewayConfig {
            retry_tick: Duration::from_millis(50),
            tries: 2,
            ..GatewayConfig::default()
        }
    }

    fn small_broker() -> Broker {
        Broker::with_config(skiff_core::BrokerConfig {
            consumer_capacity: 1,
            ..skiff_core::BrokerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_late_room_counts_only_delivery() {
        let broker = small_broker();
        let queue = broker.create_queue_if_not_exists("slow").unwrap();
        queue.try_send(Message::data(b"filler")).unwrap();
        let producer = broker.producer(&Target::queue("slow")).unwrap();

        let drain = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(70)).await;
                queue.consumer().recv().await
            })
        };

        let delivered = deliver(producer.as_ref(), Message::data(b"late"), &retry_config()).await.unwrap();
        assert!(delivered);
        drain.await.unwrap().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.discarded, 0);
    }

    #[tokio::test]
    async fn test_dropped_message_is_one_discard() {
        let broker = small_broker();
        let queue = broker.create_queue_if_not_exists("stuck").unwrap();
        queue.try_send(Message::data(b"filler")).unwrap();
        let producer = broker.producer(&Target::queue("stuck")).unwrap();

        let config = GatewayConfig {
            tries: 3,
            ..retry_config()
        };
        assert!(!deliver(producer.as_ref(), Message::data(b"lost"), &config).await.unwrap());
        assert_eq!(queue.stats().delivered, 1);
        assert_eq!(queue.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_topic_pending_consumer_closed_out_once() {
        let broker = small_broker();
        let topic = broker.create_topic_if_not_exists("ticks").unwrap();
        let free = topic.subscribe().unwrap();
        let full = topic.subscribe().unwrap();
        full.try_send(Message::data(b"filler")).unwrap();
        let producer = broker.producer(&Target::topic("ticks")).unwrap();

        assert!(!deliver(producer.as_ref(), Message::data(b"tick"), &retry_config()).await.unwrap());
        assert_eq!(free.delivered(), 1);
        assert_eq!(free.discarded(), 0);
        assert_eq!(full.delivered(), 1);
        assert_eq!(full.discarded(), 1);
    }

    async fn start() -> (SocketAddr, Arc<Broker>, watch::Sender<bool>) {
        let broker = Arc::new(Broker::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let gateway = Gateway::new(Arc::clone(&broker), GatewayConfig::default());
        tokio::spawn(async move { gateway.serve(listener, rx).await });
        (addr, broker, tx)
    }

    #[tokio::test]
    async fn test_queue_link_round_trips_through_backlog() {
        let (addr, broker, _shutdown) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/mq/queue/inbox")).await.unwrap();

        // Inbound frames land on the queue and the same link reads it back.
        ws.send(WsMessage::Binary(b"from browser".to_vec())).await.unwrap();
        assert_eq!(
            ws.next().await.unwrap().unwrap(),
            WsMessage::Binary(b"from browser".to_vec())
        );

        ws.send(WsMessage::Text("as text".to_string())).await.unwrap();
        assert_eq!(
            ws.next().await.unwrap().unwrap(),
            WsMessage::Binary(b"as text".to_vec())
        );
        assert_eq!(broker.queue("inbox").unwrap().stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_outbound_topic_messages_reach_socket() {
        let (addr, broker, _shutdown) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/mq/topic/ticks")).await.unwrap();

        let topic = loop {
            if let Some(topic) = broker.topic("ticks").filter(|t| t.consumer_count() == 1) {
                break topic;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        topic.send(Message::data(b"tick")).await.unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        assert_eq!(frame, WsMessage::Binary(b"tick".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_path_is_refused() {
        let (addr, _broker, _shutdown) = start().await;
        assert!(connect_async(format!("ws://{addr}/nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_client_close_detaches_consumer() {
        let (addr, broker, _shutdown) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/mq/topic/short")).await.unwrap();
        while broker.topic("short").map(|t| t.consumer_count()).unwrap_or(0) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if broker.topic("short").unwrap().consumer_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.topic("short").unwrap().consumer_count(), 0);
    }
}
