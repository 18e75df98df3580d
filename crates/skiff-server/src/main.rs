//! # Skiff
//!
//! Message broker with work queues and fan-out topics.
//!
//! ## Usage
//!
//! ```bash
//! # Run the broker on the default ports
//! skiff run
//!
//! # Run with a custom port and config file
//! skiff run --listen_at=:7000 --config /path/to/skiff.toml
//!
//! # Override settings through the environment
//! SKIFF_LIMITS__CONSUMER_CAPACITY=4096 skiff run
//!
//! # Publish and subscribe from the command line
//! skiff send --url=127.0.0.1:7070 --type=queue --repeat=10 orders '{"id": 1}'
//! skiff subscribe --url=127.0.0.1:7070 --type=queue --console orders
//! ```

mod commands;
mod config;
mod handlers;
mod metrics;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use skiff_protocol::TargetKind;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default broker address of the client commands.
const DEFAULT_URL: &str = "127.0.0.1:7070";

/// Command-line interface of Skiff.
#[derive(Debug, Parser)]
#[command(name = "skiff", version, about = "Skiff message broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the broker
    Run {
        /// Broker listen address: `:PORT`, `HOST:PORT` or `PORT`
        #[arg(long = "listen_at")]
        listen_at: Option<String>,
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Publish a message
    Send {
        /// Broker address
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
        /// Destination kind: queue or topic
        #[arg(long = "type", default_value = "queue", value_parser = parse_kind)]
        kind: TargetKind,
        /// Identity announced to the broker
        #[arg(long)]
        id: Option<String>,
        /// How many times to send the message
        #[arg(long, default_value_t = 1)]
        repeat: u64,
        /// Print throughput when done
        #[arg(long)]
        stat: bool,
        /// Queue or topic name
        name: String,
        /// Message body
        body: String,
    },

    /// Receive messages until interrupted
    Subscribe {
        /// Broker address
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
        /// Source kind: queue or topic
        #[arg(long = "type", default_value = "queue", value_parser = parse_kind)]
        kind: TargetKind,
        /// Identity announced to the broker
        #[arg(long)]
        id: Option<String>,
        /// Republish every message to the same target on this broker
        #[arg(long)]
        forward: Option<String>,
        /// Print every message body
        #[arg(long)]
        console: bool,
        /// Print the receive rate every second
        #[arg(long)]
        stat: bool,
        /// Queue or topic name
        name: String,
    },
}

fn parse_kind(s: &str) -> Result<TargetKind, String> {
    s.parse::<TargetKind>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "skiff=info,skiff_core=info,skiff_transport=info,skiff_client=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {
        Command::Run { listen_at, config } => {
            let mut config = config::Config::load(config.as_deref())?;
            if let Some(listen_at) = listen_at {
                config.apply_listen_at(&listen_at)?;
            }
            tracing::info!("Starting Skiff broker on {}:{}", config.host, config.port);
            handlers::run_server(config).await
        }
        Command::Send {
            url,
            kind,
            id,
            repeat,
            stat,
            name,
            body,
        } => {
            let options = commands::SendOptions {
                url,
                kind,
                id,
                repeat,
                stat,
            };
            commands::send(options, &name, body.as_bytes()).await
        }
        Command::Subscribe {
            url,
            kind,
            id,
            forward,
            console,
            stat,
            name,
        } => {
            let options = commands::SubscribeOptions {
                url,
                kind,
                id,
                forward,
                console,
                stat,
            };
            commands::subscribe(options, &name).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from([
            "skiff", "send", "--url=10.0.0.1:7070", "--type=topic", "--id=me", "--repeat=3", "--stat", "news", "hello",
        ])
        .unwrap();
        let Command::Send { url, kind, id, repeat, stat, name, body } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(url, "10.0.0.1:7070");
        assert_eq!(kind, TargetKind::Topic);
        assert_eq!(id.as_deref(), Some("me"));
        assert_eq!((repeat, stat), (3, true));
        assert_eq!((name.as_str(), body.as_str()), ("news", "hello"));
    }

    #[test]
    fn test_parse_run_and_subscribe() {
        let cli = Cli::try_parse_from(["skiff", "run", "--listen_at=:7000"]).unwrap();
        assert!(matches!(cli.command, Command::Run { listen_at: Some(ref l), config: None } if l == ":7000"));

        let cli = Cli::try_parse_from(["skiff", "subscribe", "--console", "--forward=other:7070", "jobs"]).unwrap();
        let Command::Subscribe { kind, forward, console, name, .. } = cli.command else {
            panic!("expected subscribe");
        };
        assert_eq!(kind, TargetKind::Queue);
        assert_eq!(forward.as_deref(), Some("other:7070"));
        assert!(console);
        assert_eq!(name, "jobs");

        assert!(Cli::try_parse_from(["skiff", "send", "--type=stream", "x", "y"]).is_err());
    }
}
