//! # skiff-core
//!
//! Queues, topics and back-pressured fan-out for the Skiff message broker.
//!
//! This crate provides the broker-side building blocks:
//!
//! - **Consumer** - Bounded buffer with delivered/discarded accounting
//! - **Queue** - Work queue: one shared backlog, competing readers
//! - **Topic** - Fan-out: one consumer per reader, every reader gets every message
//! - **RetrySender** - Bounded-latency fan-out over slow consumers
//! - **Broker** - Queue/topic registry with change notifications
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Producer   │────▶│   Broker    │────▶│    Queue    │──▶ shared backlog
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │    Topic    │────▶│ RetrySender │──▶ consumer, consumer, ...
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod broker;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod topic;
pub mod watcher;

pub use broker::{Broker, BrokerConfig, BrokerStats, EndpointStats};
pub use consumer::{Consumer, ConsumerId, ConsumerStats, Counters, TrySendError};
pub use error::BrokerError;
pub use producer::Producer;
pub use queue::Queue;
pub use retry::{Delivery, RetrySender};
pub use topic::{FanoutConfig, Topic};
pub use watcher::{BroadcastWatcher, NoopWatcher, WatchEvent, Watcher};
