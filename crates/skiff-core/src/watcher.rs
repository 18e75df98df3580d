//! Notifications about queues and topics coming and going.

use std::fmt;

use serde::Serialize;
use skiff_protocol::Target;
use tokio::sync::broadcast;

/// A registry change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "target", rename_all = "lowercase")]
pub enum WatchEvent {
    /// A queue or topic was registered.
    Created(Target),
    /// A queue or topic was removed.
    Removed(Target),
}

impl WatchEvent {
    /// The queue or topic concerned.
    #[must_use]
    pub fn target(&self) -> &Target {
        match self {
            WatchEvent::Created(target) | WatchEvent::Removed(target) => target,
        }
    }
}

/// Passive listener for registry changes.
///
/// Called synchronously from the registering task, so implementations must
/// not block.
pub trait Watcher: Send + Sync + fmt::Debug {
    /// A queue or topic was created.
    fn created(&self, _target: &Target) {}

    /// A queue or topic was removed.
    fn removed(&self, _target: &Target) {}
}

/// Ignores every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcher;

impl Watcher for NoopWatcher {}

/// Rebroadcasts changes to any number of async listeners.
///
/// Slow listeners lag and miss events rather than holding up the broker.
#[derive(Debug, Clone)]
pub struct BroadcastWatcher {
    tx: broadcast::Sender<WatchEvent>,
}

impl BroadcastWatcher {
    /// Create a watcher retaining up to `capacity` unread events per
    /// listener.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Start listening.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: WatchEvent) {
        // No listeners is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for BroadcastWatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Watcher for BroadcastWatcher {
    fn created(&self, target: &Target) {
        self.emit(WatchEvent::Created(target.clone()));
    }

    fn removed(&self, target: &Target) {
        self.emit(WatchEvent::Removed(target.clone()));
    }
}
