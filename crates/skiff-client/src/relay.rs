//! File relay between a directory tree and the broker.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/outgoing/<queue|topic>/<name>/<millis>-<uuid>.msg   broker → disk
//! <base>/incoming/<queue|topic>/<name>/<any file>             disk → broker
//! ```
//!
//! Outgoing files are written to a hidden temporary name and renamed into
//! place, so a reader never sees a partial file. Incoming files are sent
//! as `DATA` and deleted after the send succeeded, which for a remote
//! [`Publisher`](crate::Publisher) means after the link wrote it; a crash
//! in between sends the file again on the next run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use skiff_core::{BrokerError, Producer};
use skiff_protocol::{Command, Message, Target};
use skiff_transport::{spawn_supervised, TaskError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::handler::MessageHandler;

/// Extension of relayed files.
pub const MESSAGE_EXTENSION: &str = "msg";

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Root of the `incoming/` and `outgoing/` trees.
    pub base: PathBuf,
    /// How often the incoming directory is scanned.
    pub poll_interval: Duration,
}

impl RelayConfig {
    /// Defaults under `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// `<base>/outgoing/<kind>/<name>`.
    #[must_use]
    pub fn outgoing_dir(&self, target: &Target) -> PathBuf {
        self.base.join("outgoing").join(target.kind.as_str()).join(&target.name)
    }

    /// `<base>/incoming/<kind>/<name>`.
    #[must_use]
    pub fn incoming_dir(&self, target: &Target) -> PathBuf {
        self.base.join("incoming").join(target.kind.as_str()).join(&target.name)
    }
}

fn unique_file_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{millis:013}-{}.{MESSAGE_EXTENSION}", uuid::Uuid::new_v4().simple())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.'))
}

/// Writes the payload of every `DATA` message to its own file.
///
/// Use it as the handler of a [`Subscriber`](crate::Subscriber).
#[derive(Debug)]
pub struct OutgoingRelay {
    dir: PathBuf,
    written: AtomicU64,
    failed: AtomicU64,
}

impl OutgoingRelay {
    /// Relay for `target` under `config.base`. The directory is created on
    /// first write.
    #[must_use]
    pub fn new(config: &RelayConfig, target: &Target) -> Self {
        Self {
            dir: config.outgoing_dir(target),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Destination directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Messages that could not be written.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Write `payload` to a new file and return its path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or the file cannot be written.
    pub async fn write(&self, payload: &[u8]) -> Result<PathBuf, ClientError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = unique_file_name();
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(name);

        tokio::fs::write(&tmp, payload).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(path)
    }
}

#[async_trait]
impl MessageHandler for OutgoingRelay {
    async fn handle(&self, message: Message) {
        if message.command() != Command::Data {
            return;
        }
        match self.write(message.payload_ref()).await {
            Ok(path) => debug!(path = %path.display(), len = message.payload_len(), "Message written"),
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(dir = %self.dir.display(), error = %e, "Failed to write message");
            }
        }
    }
}

/// Send every file in `dir` to `producer`, deleting each one after it was
/// sent. Hidden files are skipped. A missing directory counts as empty.
///
/// Stops at the first file that cannot be sent; it stays for the next
/// scan.
///
/// # Errors
///
/// Returns an error if the directory cannot be read, a file cannot be read
/// or deleted, or the producer refuses a message.
pub async fn drain_dir(dir: &Path, producer: &dyn Producer) -> Result<usize, ClientError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut sent = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_hidden(&path) || !entry.file_type().await?.is_file() {
            continue;
        }

        let payload = tokio::fs::read(&path).await?;
        let message = Message::try_new(Command::Data, &payload)?;
        match producer.send(message).await {
            Ok(()) => {}
            // Some subscribers got it; resending would duplicate for them.
            Err(BrokerError::PartialSend { pending }) => {
                debug!(path = %path.display(), pending, "File reached only part of the subscribers");
            }
            Err(e) => return Err(e.into()),
        }
        tokio::fs::remove_file(&path).await?;
        sent += 1;
    }
    Ok(sent)
}

/// Periodically moves files from the incoming directory into a producer,
/// which may be a local queue or topic or a remote [`Publisher`](crate::Publisher).
pub struct IncomingRelay {
    dir: PathBuf,
    sent: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Result<(), TaskError>>>>,
}

impl std::fmt::Debug for IncomingRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingRelay")
            .field("dir", &self.dir)
            .field("sent", &self.sent())
            .finish()
    }
}

impl IncomingRelay {
    /// Start scanning `config.incoming_dir(target)`. Must be called inside a
    /// tokio runtime.
    pub fn spawn(config: &RelayConfig, target: &Target, producer: Arc<dyn Producer>) -> Self {
        let dir = config.incoming_dir(target);
        let sent = Arc::new(AtomicU64::new(0));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = spawn_supervised(
            format!("incoming relay {target}"),
            scan(dir.clone(), config.poll_interval, producer, Arc::clone(&sent), shutdown_rx),
        );
        info!(dir = %dir.display(), %target, "Incoming relay started");
        Self {
            dir,
            sent,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Scanned directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files sent so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stop scanning and wait for the task. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the scanning task panicked.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.shutdown.send_replace(true);
        let mut task = self.task.lock().await;
        match task.take() {
            Some(handle) => Ok(handle.await??),
            None => Ok(()),
        }
    }
}

impl Drop for IncomingRelay {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn scan(dir: PathBuf, every: Duration, producer: Arc<dyn Producer>, sent: Arc<AtomicU64>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        // A producer that cannot write holds the scan; the file stays.
        let drained = tokio::select! {
            drained = drain_dir(&dir, producer.as_ref()) => drained,
            _ = shutdown.changed() => break,
        };
        match drained {
            Ok(0) => {}
            Ok(n) => {
                sent.fetch_add(n as u64, Ordering::Relaxed);
                debug!(dir = %dir.display(), files = n, "Files relayed");
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Relay scan failed"),
        }
    }
    debug!(dir = %dir.display(), "Incoming relay stopped");
}
