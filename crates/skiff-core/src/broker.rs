//! Queue and topic registry.
//!
//! The broker is read often and written rarely. Creation goes through the
//! map's entry API so concurrent callers asking for the same name always
//! end up with one shared instance.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use skiff_protocol::{validate_name, Target, TargetKind};
use tracing::{debug, info};

use crate::consumer::Counters;
use crate::error::BrokerError;
use crate::producer::Producer;
use crate::queue::Queue;
use crate::topic::{FanoutConfig, Topic};
use crate::watcher::{NoopWatcher, Watcher};

/// Broker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Buffer capacity of queue backlogs and topic consumers.
    pub consumer_capacity: usize,
    /// How long a topic publish keeps retrying slow consumers.
    pub delivery_timeout: Duration,
    /// Pause between topic retry rounds.
    pub retry_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let fanout = FanoutConfig::default();
        Self {
            consumer_capacity: fanout.capacity,
            delivery_timeout: fanout.delivery_timeout,
            retry_interval: fanout.retry_interval,
        }
    }
}

impl BrokerConfig {
    fn fanout(&self) -> FanoutConfig {
        FanoutConfig {
            capacity: self.consumer_capacity,
            delivery_timeout: self.delivery_timeout,
            retry_interval: self.retry_interval,
        }
    }
}

/// Counters of one queue or topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    /// Endpoint name.
    pub name: String,
    /// Queue or topic.
    pub kind: TargetKind,
    /// Attached topic consumers (queues report their single backlog).
    pub consumers: usize,
    /// Messages accepted into buffers.
    pub delivered: u64,
    /// Messages given up on.
    pub discarded: u64,
    /// Messages waiting in buffers.
    pub buffered: usize,
}

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Per-queue counters, sorted by name.
    pub queues: Vec<EndpointStats>,
    /// Per-topic counters, sorted by name.
    pub topics: Vec<EndpointStats>,
    /// Delivered by endpoints removed since startup.
    pub removed_delivered: u64,
    /// Discarded by endpoints removed since startup.
    pub removed_discarded: u64,
}

impl BrokerStats {
    /// Delivered messages over all endpoints.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.removed_delivered + self.queues.iter().chain(&self.topics).map(|e| e.delivered).sum::<u64>()
    }

    /// Discarded messages over all endpoints.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.removed_discarded + self.queues.iter().chain(&self.topics).map(|e| e.discarded).sum::<u64>()
    }
}

/// The queue/topic registry.
pub struct Broker {
    queues: DashMap<String, Arc<Queue>>,
    topics: DashMap<String, Arc<Topic>>,
    removed: Counters,
    watcher: Arc<dyn Watcher>,
    config: BrokerConfig,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.queues.len())
            .field("topics", &self.topics.len())
            .field("watcher", &self.watcher)
            .field("config", &self.config)
            .finish()
    }
}

fn check_name(name: &str) -> Result<(), BrokerError> {
    validate_name(name).map_err(|reason| BrokerError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

impl Broker {
    /// Broker with default configuration and no watcher.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        Self::with_watcher(config, Arc::new(NoopWatcher))
    }

    /// Broker reporting registry changes to `watcher`.
    #[must_use]
    pub fn with_watcher(config: BrokerConfig, watcher: Arc<dyn Watcher>) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            queues: DashMap::new(),
            topics: DashMap::new(),
            removed: Counters::default(),
            watcher,
            config,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Get or create a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidName`] for a name that cannot be used.
    pub fn create_queue_if_not_exists(&self, name: &str) -> Result<Arc<Queue>, BrokerError> {
        if let Some(queue) = self.queues.get(name) {
            return Ok(Arc::clone(queue.value()));
        }
        check_name(name)?;

        let (queue, created) = match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let queue = Arc::new(Queue::new(name, self.config.consumer_capacity));
                entry.insert(Arc::clone(&queue));
                (queue, true)
            }
        };

        // Notify after the shard lock is released.
        if created {
            debug!(queue = %name, "Queue created");
            self.watcher.created(&Target::queue(name));
        }
        Ok(queue)
    }

    /// Get or create a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidName`] for a name that cannot be used.
    pub fn create_topic_if_not_exists(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        if let Some(topic) = self.topics.get(name) {
            return Ok(Arc::clone(topic.value()));
        }
        check_name(name)?;

        let (topic, created) = match self.topics.entry(name.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let topic = Arc::new(Topic::new(name, self.config.fanout()));
                entry.insert(Arc::clone(&topic));
                (topic, true)
            }
        };

        if created {
            debug!(topic = %name, "Topic created");
            self.watcher.created(&Target::topic(name));
        }
        Ok(topic)
    }

    /// Look up a queue.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    /// Look up a topic.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|t| Arc::clone(t.value()))
    }

    /// Get or create the producer for a target.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidName`] for a name that cannot be used.
    pub fn producer(&self, target: &Target) -> Result<Arc<dyn Producer>, BrokerError> {
        let producer: Arc<dyn Producer> = match target.kind {
            TargetKind::Queue => self.create_queue_if_not_exists(&target.name)?,
            TargetKind::Topic => self.create_topic_if_not_exists(&target.name)?,
        };
        Ok(producer)
    }

    /// Remove and close a queue. Returns whether it existed.
    pub fn remove_queue(&self, name: &str) -> bool {
        let Some((_, queue)) = self.queues.remove(name) else {
            return false;
        };
        queue.close();
        self.removed.absorb(queue.stats());
        self.watcher.removed(&Target::queue(name));
        debug!(queue = %name, "Queue removed");
        true
    }

    /// Remove and close a topic. Returns whether it existed.
    pub fn remove_topic(&self, name: &str) -> bool {
        let Some((_, topic)) = self.topics.remove(name) else {
            return false;
        };
        topic.close();
        self.removed.absorb(topic.stats());
        self.watcher.removed(&Target::topic(name));
        debug!(topic = %name, "Topic removed");
        true
    }

    /// Queue names, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Topic names, sorted.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Names of one kind, sorted.
    #[must_use]
    pub fn names(&self, kind: TargetKind) -> Vec<String> {
        match kind {
            TargetKind::Queue => self.queue_names(),
            TargetKind::Topic => self.topic_names(),
        }
    }

    /// Counters of every endpoint.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let mut queues: Vec<_> = self
            .queues
            .iter()
            .map(|e| {
                let s = e.value().stats();
                EndpointStats {
                    name: e.key().clone(),
                    kind: TargetKind::Queue,
                    consumers: 1,
                    delivered: s.delivered,
                    discarded: s.discarded,
                    buffered: s.buffered,
                }
            })
            .collect();
        let mut topics: Vec<_> = self
            .topics
            .iter()
            .map(|e| {
                let topic = e.value();
                let s = topic.stats();
                EndpointStats {
                    name: e.key().clone(),
                    kind: TargetKind::Topic,
                    consumers: topic.consumer_count(),
                    delivered: s.delivered,
                    discarded: s.discarded,
                    buffered: s.buffered,
                }
            })
            .collect();
        queues.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        topics.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        BrokerStats {
            queues,
            topics,
            removed_delivered: self.removed.delivered(),
            removed_discarded: self.removed.discarded(),
        }
    }

    /// Close and remove every queue and topic.
    pub fn close(&self) {
        for name in self.queue_names() {
            self.remove_queue(&name);
        }
        for name in self.topic_names() {
            self.remove_topic(&name);
        }
        info!("Broker closed");
    }
}
