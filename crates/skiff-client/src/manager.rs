//! Subscribers for a growing family of queues or topics.
//!
//! A [`QueueManager`] discovers names on the broker, either by polling the
//! HTTP listing endpoints (`GET <url>/mq/queues`, `GET <url>/mq/topics`)
//! or by following a stream of [`WatchEvent`]s, and opens one
//! [`Subscriber`] for every name its matcher accepts. Handlers are created
//! lazily, the first time a name shows up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use skiff_core::WatchEvent;
use skiff_protocol::{validate_name, Target, TargetKind};
use skiff_transport::{spawn_supervised, TaskError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::builder::ClientBuilder;
use crate::error::ClientError;
use crate::handler::MessageHandler;
use crate::subscriber::Subscriber;

/// Decides which discovered names get a subscriber.
pub type Matcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Creates the handler for a newly discovered target.
pub type HandlerFactory = Arc<dyn Fn(&Target) -> Arc<dyn MessageHandler> + Send + Sync>;

/// Matcher accepting names that start with `prefix`.
pub fn prefix(prefix: impl Into<String>) -> Matcher {
    let prefix = prefix.into();
    Arc::new(move |name: &str| name.starts_with(prefix.as_str()))
}

/// Matcher accepting every name.
#[must_use]
pub fn any() -> Matcher {
    Arc::new(|_: &str| true)
}

/// How names are discovered.
#[derive(Debug)]
pub enum Discovery {
    /// Poll the broker's HTTP listing at this base URL.
    Http {
        /// Base URL of the admin endpoint, e.g. `http://127.0.0.1:7072`.
        url: String,
    },
    /// Follow creation events.
    Events(broadcast::Receiver<WatchEvent>),
}

/// Polling cadence.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Tick length.
    pub poll_interval: Duration,
    /// Ticks that all poll before slowing down.
    pub slow_after: u64,
    /// Once slowed down, poll on every this many ticks.
    pub slow_every: u64,
    /// Timeout of one listing request.
    pub http_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            slow_after: 60,
            slow_every: 30,
            http_timeout: Duration::from_secs(5),
        }
    }
}

/// Decides on each tick whether to poll: every tick at first, then only
/// every `slow_every`-th.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    tick: u64,
    slow_after: u64,
    slow_every: u64,
}

impl PollSchedule {
    /// Schedule from `config`.
    #[must_use]
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            tick: 0,
            slow_after: config.slow_after,
            slow_every: config.slow_every.max(1),
        }
    }

    /// Advance one tick; `true` if this tick polls.
    pub fn next_tick(&mut self) -> bool {
        self.tick += 1;
        self.tick <= self.slow_after || self.tick % self.slow_every == 0
    }
}

/// Fetch the names of every queue or topic from the listing endpoint.
///
/// # Errors
///
/// Returns [`ClientError::Http`] if the request fails, the status is not a
/// success or the body is not a JSON array of strings.
pub async fn list_names(http: &reqwest::Client, url: &str, kind: TargetKind) -> Result<Vec<String>, ClientError> {
    let endpoint = format!("{}/mq/{}s", url.trim_end_matches('/'), kind.as_str());
    let names = http
        .get(&endpoint)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<String>>()
        .await?;
    Ok(names)
}

struct Inner {
    client: ClientBuilder,
    kind: TargetKind,
    matcher: Matcher,
    factory: HandlerFactory,
    handlers: DashMap<String, Arc<Subscriber>>,
    closed: AtomicBool,
}

impl Inner {
    fn track(&self, name: &str) -> bool {
        if self.closed.load(Ordering::Acquire) || !(self.matcher)(name) {
            return false;
        }
        if let Err(reason) = validate_name(name) {
            warn!(name, reason, "Skipping unusable name");
            return false;
        }

        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            // Checked under the shard lock, so close cannot sweep past this insert.
            Entry::Vacant(_) if self.closed.load(Ordering::Acquire) => false,
            Entry::Vacant(slot) => {
                let target = Target::new(self.kind, name);
                let handler = (self.factory)(&target);
                info!(%target, "Subscribing to discovered {}", self.kind);
                slot.insert(Arc::new(self.client.subscriber_shared(target, handler)));
                true
            }
        }
    }
}

/// Keeps one subscriber per discovered, matching name.
pub struct QueueManager {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Result<(), TaskError>>>>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("kind", &self.inner.kind)
            .field("handlers", &self.inner.handlers.len())
            .finish()
    }
}

impl QueueManager {
    /// Start discovering `kind` names. Must be called inside a tokio
    /// runtime.
    pub fn spawn(client: ClientBuilder, kind: TargetKind, discovery: Discovery, matcher: Matcher, factory: HandlerFactory) -> Self {
        Self::with_config(client, kind, discovery, matcher, factory, ManagerConfig::default())
    }

    /// Like [`spawn`](Self::spawn) with an explicit cadence.
    pub fn with_config(
        client: ClientBuilder,
        kind: TargetKind,
        discovery: Discovery,
        matcher: Matcher,
        factory: HandlerFactory,
        config: ManagerConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            client,
            kind,
            matcher,
            factory,
            handlers: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = match discovery {
            Discovery::Http { url } => spawn_supervised(
                format!("{kind} discovery"),
                poll_listing(Arc::clone(&inner), url, config, shutdown_rx),
            ),
            Discovery::Events(events) => spawn_supervised(
                format!("{kind} events"),
                follow_events(Arc::clone(&inner), events, shutdown_rx),
            ),
        };

        Self {
            inner,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Subscribe to `name` now if it matches and is not tracked yet.
    /// Returns whether a subscriber was created.
    pub fn track(&self, name: &str) -> bool {
        self.inner.track(name)
    }

    /// Names with a subscriber, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The subscriber for `name`, if any.
    #[must_use]
    pub fn subscriber(&self, name: &str) -> Option<Arc<Subscriber>> {
        self.inner.handlers.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Stop discovering and close every subscriber. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first error of the discovery task or a subscriber.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.inner.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);

        let mut task = self.task.lock().await;
        let discovery = match task.take() {
            Some(handle) => handle.await?.map_err(ClientError::from),
            None => Ok(()),
        };

        let names: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        let subscribers: Vec<Arc<Subscriber>> = names
            .iter()
            .filter_map(|name| self.inner.handlers.remove(name))
            .map(|(_, subscriber)| subscriber)
            .collect();
        let closed = join_all(subscribers.iter().map(|s| s.close())).await;
        discovery?;
        closed.into_iter().collect()
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn poll_listing(inner: Arc<Inner>, url: String, config: ManagerConfig, mut shutdown: watch::Receiver<bool>) {
    let http = match reqwest::Client::builder().timeout(config.http_timeout).build() {
        Ok(http) => http,
        Err(e) => {
            warn!(error = %e, "Cannot build HTTP client, discovery disabled");
            return;
        }
    };

    let mut schedule = PollSchedule::new(&config);
    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = Backoff::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if !schedule.next_tick() {
            continue;
        }

        match list_names(&http, &url, inner.kind).await {
            Ok(names) => {
                failures.reset();
                for name in names {
                    inner.track(&name);
                }
            }
            Err(e) => {
                failures.fail();
                if failures.should_log() {
                    warn!(%url, failures = failures.failures(), error = %e, "Listing failed");
                }
            }
        }
    }
    debug!(%url, "Discovery stopped");
}

async fn follow_events(inner: Arc<Inner>, mut events: broadcast::Receiver<WatchEvent>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(WatchEvent::Created(target)) if target.kind == inner.kind => {
                    inner.track(&target.name);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Discovery fell behind on events"),
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(kind = %inner.kind, "Event discovery stopped");
}
