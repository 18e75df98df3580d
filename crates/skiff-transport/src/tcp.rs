//! Framed message connections over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use skiff_protocol::codec::write_message;
use skiff_protocol::handshake::{handshake, write_magic, read_magic_timeout};
use skiff_protocol::{Message, MessageCodec};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};

use crate::traits::{Connection, ConnectionId, TransportError};

/// Reading half: decodes messages from a buffered byte stream.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: BufReader<R>,
    codec: MessageCodec,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wrap a byte stream.
    pub fn new(inner: R, codec: MessageCodec) -> Self {
        Self {
            inner: BufReader::new(inner),
            codec,
        }
    }

    /// Codec in use.
    #[must_use]
    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// Read the next message.
    ///
    /// Returns `None` when the stream ends on a message boundary; an end of
    /// stream inside a message is a transport error.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed input or an I/O error.
    pub async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        if self.inner.fill_buf().await?.is_empty() {
            return Ok(None);
        }
        let message = self.codec.read(&mut self.inner).await?;
        trace!(command = %message.command(), len = message.payload_len(), "Message received");
        Ok(Some(message))
    }
}

/// Writing half: writes encoded messages and flushes each one.
#[derive(Debug)]
pub struct MessageWriter<W> {
    inner: W,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one message.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        write_message(&mut self.inner, message).await?;
        trace!(command = %message.command(), len = message.payload_len(), "Message sent");
        Ok(())
    }

    /// Shut the write direction down.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A handshaken TCP connection carrying framed messages.
#[derive(Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    reader: MessageReader<OwnedReadHalf>,
    writer: MessageWriter<OwnedWriteHalf>,
    remote_addr: Option<SocketAddr>,
    open: bool,
}

impl TcpConnection {
    /// Dial `addr` and run the handshake. Reading the peer's magic is
    /// bounded by `handshake_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the dial or the handshake fails.
    pub async fn connect<A>(addr: A, handshake_timeout: Duration, codec: MessageCodec) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs,
    {
        let mut stream = tokio::time::timeout(handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        handshake(&mut stream, Some(handshake_timeout)).await?;
        Ok(Self::from_stream(stream, codec))
    }

    /// Run the server side of the handshake on an accepted stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer does not send the magic in time.
    pub async fn accept(mut stream: TcpStream, handshake_timeout: Duration, codec: MessageCodec) -> Result<Self, TransportError> {
        write_magic(&mut stream).await?;
        read_magic_timeout(&mut stream, handshake_timeout).await?;
        Ok(Self::from_stream(stream, codec))
    }

    fn from_stream(stream: TcpStream, codec: MessageCodec) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let remote_addr = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            id: ConnectionId::generate(),
            reader: MessageReader::new(read, codec),
            writer: MessageWriter::new(write),
            remote_addr,
            open: true,
        }
    }

    /// Split into independently owned halves.
    #[must_use]
    pub fn into_split(self) -> (MessageReader<OwnedReadHalf>, MessageWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }

    /// Codec in use.
    #[must_use]
    pub fn codec(&self) -> &MessageCodec {
        self.reader.codec()
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        let message = self.reader.recv().await?;
        if message.is_none() {
            self.open = false;
        }
        Ok(message)
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.writer.send(message).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        self.writer.shutdown().await
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_protocol::{Command, ProtocolError, Target};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(server, MessageCodec::new());

        let writer = tokio::spawn(async move {
            let mut writer = MessageWriter::new(client);
            writer.send(&Message::subscribe(&Target::topic("t"))).await.unwrap();
            writer.send(&Message::data(vec![7u8; 70_000])).await.unwrap();
        });

        let first = reader.recv().await.unwrap().unwrap();
        assert_eq!(first.command(), Command::Sub);
        let second = reader.recv().await.unwrap().unwrap();
        assert_eq!(second.payload_len(), 70_000);
        writer.await.unwrap();
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_message_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(server, MessageCodec::new());

        let encoded = skiff_protocol::encode(&Message::data(b"truncated"));
        tokio::io::AsyncWriteExt::write_all(&mut client, &encoded[..encoded.len() - 3])
            .await
            .unwrap();
        drop(client);

        let err = reader.recv().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = TcpConnection::accept(stream, Duration::from_secs(1), MessageCodec::new())
                .await
                .unwrap();
            let message = conn.recv().await.unwrap().unwrap();
            conn.send(&Message::ack()).await.unwrap();
            message
        });

        let mut conn = TcpConnection::connect(addr, Duration::from_secs(1), MessageCodec::new())
            .await
            .unwrap();
        conn.send(&Message::id("tester")).await.unwrap();
        assert_eq!(conn.recv().await.unwrap().unwrap().command(), Command::Ack);
        assert_eq!(server.await.unwrap().payload_ref(), b"tester");

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_connect_to_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let started = std::time::Instant::now();
        let err = TcpConnection::connect(addr, Duration::from_millis(100), MessageCodec::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::HandshakeTimeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        silent.abort();
    }

    #[tokio::test]
    async fn test_accept_rejects_bad_magic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            stream
        });

        let (stream, _) = listener.accept().await.unwrap();
        let err = TcpConnection::accept(stream, Duration::from_secs(1), MessageCodec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(ProtocolError::MagicNumber(_))));
        drop(client.await.unwrap());
    }
}
