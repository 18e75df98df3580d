//! # skiff-transport
//!
//! Network plumbing for the Skiff message broker.
//!
//! This crate connects byte streams to the broker core:
//!
//! - **TCP** - Framed [`TcpConnection`]s speaking the Skiff wire protocol
//! - **Session** - Broker-side handshake, control phase and link loops
//! - **WebSocket** - Gateway bridging browsers to queues and topics
//! - **Task** - Panic-catching task supervision
//!
//! ## Connection Abstraction
//!
//! Session logic is written against the [`Connection`] trait, so the
//! control phase runs over any framed transport.
//!
//! ```rust,ignore
//! use skiff_transport::{Connection, session};
//!
//! async fn handle(conn: &mut dyn Connection, broker: &skiff_core::Broker) {
//!     match session::negotiate(conn, broker).await {
//!         Ok(negotiated) => { /* run the link */ }
//!         Err(e) => tracing::warn!("control phase failed: {}", e),
//!     }
//! }
//! ```

pub mod attach;
pub mod session;
pub mod task;
pub mod tcp;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use attach::Attachment;
pub use session::{SessionConfig, SessionEnd, SessionServer, SessionStats};
pub use task::{spawn_supervised, supervised, TaskError};
pub use tcp::{MessageReader, MessageWriter, TcpConnection};
pub use traits::{Connection, ConnectionId, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{Gateway, GatewayConfig};
