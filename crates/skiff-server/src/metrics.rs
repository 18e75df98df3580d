//! Metrics collection and export for Skiff.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use skiff_core::{Broker, Watcher};
use skiff_protocol::{Target, TargetKind};
use skiff_transport::SessionStats;
use tokio::sync::watch;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "skiff_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "skiff_connections_active";
    pub const QUEUES_ACTIVE: &str = "skiff_queues_active";
    pub const TOPICS_ACTIVE: &str = "skiff_topics_active";
    pub const MESSAGES_DELIVERED: &str = "skiff_messages_delivered_total";
    pub const MESSAGES_DISCARDED: &str = "skiff_messages_discarded_total";
    pub const MESSAGES_BUFFERED: &str = "skiff_messages_buffered";
    pub const ERRORS_TOTAL: &str = "skiff_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(names::QUEUES_ACTIVE, "Current number of queues");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of topics");
    metrics::describe_counter!(
        names::MESSAGES_DELIVERED,
        "Messages accepted into consumer buffers"
    );
    metrics::describe_counter!(
        names::MESSAGES_DISCARDED,
        "Messages given up on for slow or closed consumers"
    );
    metrics::describe_gauge!(names::MESSAGES_BUFFERED, "Messages waiting in buffers");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Connections that ended with an error");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn endpoint_gauge(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Queue => names::QUEUES_ACTIVE,
        TargetKind::Topic => names::TOPICS_ACTIVE,
    }
}

/// Keeps the queue and topic gauges in step with the registry.
#[derive(Debug, Default)]
pub struct MetricsWatcher;

impl Watcher for MetricsWatcher {
    fn created(&self, target: &Target) {
        gauge!(endpoint_gauge(target.kind)).increment(1.0);
    }

    fn removed(&self, target: &Target) {
        gauge!(endpoint_gauge(target.kind)).decrement(1.0);
    }
}

/// Connection counters of one listener.
#[derive(Debug, Clone)]
pub struct Listener {
    /// Label value, e.g. `tcp` or `websocket`.
    pub transport: &'static str,
    /// The listener's counters.
    pub stats: Arc<SessionStats>,
}

/// Copy broker and connection counters into the metrics registry once.
pub fn sample(broker: &Broker, listeners: &[Listener]) {
    let stats = broker.stats();
    counter!(names::MESSAGES_DELIVERED).absolute(stats.delivered());
    counter!(names::MESSAGES_DISCARDED).absolute(stats.discarded());
    let buffered: usize = stats.queues.iter().chain(&stats.topics).map(|e| e.buffered).sum();
    gauge!(names::MESSAGES_BUFFERED).set(buffered as f64);

    for listener in listeners {
        let transport = listener.transport;
        counter!(names::CONNECTIONS_TOTAL, "transport" => transport).absolute(listener.stats.total());
        gauge!(names::CONNECTIONS_ACTIVE, "transport" => transport).set(listener.stats.active() as f64);
        counter!(names::ERRORS_TOTAL, "transport" => transport).absolute(listener.stats.failed());
    }
}

/// Sample every `every` until `shutdown` flips.
pub async fn run_sampler(broker: Arc<Broker>, listeners: Vec<Listener>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => sample(&broker, &listeners),
            _ = shutdown.changed() => break,
        }
    }
    sample(&broker, &listeners);
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::BrokerConfig;
    use skiff_protocol::Message;

    #[tokio::test]
    async fn test_watcher_and_sampler_without_recorder() {
        // No recorder is installed, so every call is a no-op.
        let broker = Arc::new(Broker::with_watcher(BrokerConfig::default(), Arc::new(MetricsWatcher)));
        let queue = broker.create_queue_if_not_exists("jobs").unwrap();
        queue.send(Message::data(b"x")).await.unwrap();
        assert!(broker.remove_queue("jobs"));

        let listeners = vec![Listener {
            transport: "tcp",
            stats: Arc::new(SessionStats::default()),
        }];
        sample(&broker, &listeners);

        let (tx, rx) = watch::channel(false);
        let sampler = tokio::spawn(run_sampler(Arc::clone(&broker), listeners, Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(true);
        sampler.await.unwrap();
    }
}
