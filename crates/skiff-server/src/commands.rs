//! The `send` and `subscribe` client commands.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use skiff_client::{ClientBuilder, MessageHandler, Publisher};
use skiff_protocol::{validate_name, Message, Target, TargetKind};
use tracing::{info, warn};

/// How long a command waits for the broker before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options of `skiff send`.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub url: String,
    pub kind: TargetKind,
    pub id: Option<String>,
    pub repeat: u64,
    pub stat: bool,
}

/// Options of `skiff subscribe`.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub url: String,
    pub kind: TargetKind,
    pub id: Option<String>,
    pub forward: Option<String>,
    pub console: bool,
    pub stat: bool,
}

fn client(url: &str, id: Option<&str>) -> ClientBuilder {
    let client = ClientBuilder::new(url);
    match id {
        Some(id) => client.identity(id),
        None => client,
    }
}

fn target(kind: TargetKind, name: &str) -> Result<Target> {
    validate_name(name).map_err(|reason| anyhow::anyhow!("Invalid name {name:?}: {reason}"))?;
    Ok(Target::new(kind, name))
}

async fn connected(publisher: &Publisher, url: &str) -> Result<()> {
    tokio::time::timeout(CONNECT_TIMEOUT, publisher.ready())
        .await
        .with_context(|| format!("Timed out connecting to {url}"))?
        .with_context(|| format!("Cannot connect to {url}"))
}

/// Publish `body` `repeat` times, then close the link cleanly.
///
/// # Errors
///
/// Returns an error if the broker cannot be reached.
pub async fn send(options: SendOptions, name: &str, body: &[u8]) -> Result<()> {
    let target = target(options.kind, name)?;
    let publisher = client(&options.url, options.id.as_deref()).publisher(target.clone());
    connected(&publisher, &options.url).await?;

    let started = Instant::now();
    let message = Message::try_new(skiff_protocol::Command::Data, body)?;
    for _ in 0..options.repeat {
        publisher.send(message.clone()).await?;
    }
    publisher.close().await?;

    let elapsed = started.elapsed();
    info!(%target, messages = options.repeat, ?elapsed, "Sent");
    if options.stat {
        let rate = options.repeat as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        println!("sent {} messages to {target} in {elapsed:.2?} ({rate:.0} msg/s)", options.repeat);
    }
    Ok(())
}

struct PrintHandler {
    console: bool,
    forward: Option<Arc<Publisher>>,
    received: Arc<AtomicU64>,
}

#[async_trait]
impl MessageHandler for PrintHandler {
    async fn handle(&self, message: Message) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if self.console {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(message.payload_ref());
            let _ = out.write_all(b"\n");
        }
        if let Some(forward) = &self.forward {
            if let Err(e) = forward.send(message).await {
                warn!(error = %e, "Forwarding failed");
            }
        }
    }
}

/// Receive from `name` until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the name is invalid or closing fails.
pub async fn subscribe(options: SubscribeOptions, name: &str) -> Result<()> {
    let target = target(options.kind, name)?;
    let received = Arc::new(AtomicU64::new(0));

    let forward = options.forward.as_deref().map(|url| {
        info!(%target, to = %url, "Forwarding");
        Arc::new(client(url, options.id.as_deref()).publisher(target.clone()))
    });
    let handler = PrintHandler {
        console: options.console,
        forward: forward.clone(),
        received: Arc::clone(&received),
    };
    let subscriber = client(&options.url, options.id.as_deref()).subscriber(target.clone(), handler);

    let stat = options.stat.then(|| {
        let received = Arc::clone(&received);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut last = 0;
            loop {
                interval.tick().await;
                let now = received.load(Ordering::Relaxed);
                eprintln!("{} msg/s ({now} total)", now - last);
                last = now;
            }
        })
    });

    tokio::signal::ctrl_c().await.context("Cannot listen for Ctrl-C")?;
    info!(%target, received = received.load(Ordering::Relaxed), "Stopping");
    if let Some(stat) = stat {
        stat.abort();
    }
    subscriber.close().await?;
    if let Some(forward) = forward {
        forward.close().await?;
    }
    Ok(())
}
