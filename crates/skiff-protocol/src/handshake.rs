//! Connection handshake.
//!
//! Both peers open the stream by writing the 4-byte magic `aav1` and reading
//! the other side's copy. A peer that sends anything else is rejected before
//! any message is exchanged.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::ProtocolError;

/// Protocol magic, doubling as the protocol version.
pub const MAGIC: [u8; 4] = *b"aav1";

/// Default bound on waiting for the peer's magic.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write the magic and flush.
///
/// # Errors
///
/// Returns an error on I/O failure.
pub async fn write_magic<W>(writer: &mut W) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&MAGIC).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly four bytes and compare them with [`MAGIC`].
///
/// # Errors
///
/// Returns [`ProtocolError::MagicNumber`] on mismatch, or an I/O error.
pub async fn read_magic<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(ProtocolError::MagicNumber(magic));
    }
    Ok(())
}

/// [`read_magic`] bounded by `timeout`.
///
/// # Errors
///
/// Returns [`ProtocolError::HandshakeTimeout`] if the peer stays silent past
/// the deadline.
pub async fn read_magic_timeout<R>(reader: &mut R, timeout: Duration) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::time::timeout(timeout, read_magic(reader))
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout(timeout))?
}

/// Run the full handshake over a duplex stream: write our magic, then read
/// the peer's, optionally bounded.
///
/// # Errors
///
/// Returns an error on mismatch, timeout or I/O failure.
pub async fn handshake<S>(stream: &mut S, timeout: Option<Duration>) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    write_magic(stream).await?;
    match timeout {
        Some(timeout) => read_magic_timeout(stream, timeout).await,
        None => read_magic(stream).await,
    }
}
