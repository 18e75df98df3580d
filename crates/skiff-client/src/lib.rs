//! # skiff-client
//!
//! Client side of the Skiff broker.
//!
//! ```text
//!  ClientBuilder ──publisher()──▶ Publisher ──buffer──▶ link task ──PUB──▶ broker
//!               └─subscriber()─▶ Subscriber ◀─handler── link task ◀─SUB── broker
//!
//!  QueueManager: discovery (HTTP listing | watch events) ──▶ one Subscriber per name
//!  IncomingRelay: <base>/incoming/..  ──▶ any Producer
//!  OutgoingRelay: Subscriber handler  ──▶ <base>/outgoing/..
//! ```
//!
//! Every link is its own task that reconnects on failure, pacing attempts
//! with [`Backoff`], until it is closed. Closing is idempotent and waits
//! for the task to exit.

pub mod backoff;
pub mod builder;
pub mod error;
pub mod handler;
pub mod link;
pub mod manager;
pub mod publisher;
pub mod relay;
pub mod subscriber;

pub use backoff::Backoff;
pub use builder::{ClientBuilder, ClientConfig};
pub use error::ClientError;
pub use handler::MessageHandler;
pub use link::LinkState;
pub use manager::{Discovery, ManagerConfig, QueueManager};
pub use publisher::Publisher;
pub use relay::{IncomingRelay, OutgoingRelay, RelayConfig};
pub use subscriber::Subscriber;
