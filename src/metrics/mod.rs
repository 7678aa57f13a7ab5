//! Metric plumbing for the core.
//!
//! The core components never talk to a metrics backend directly: they hold
//! a [`MetricsExporter`] trait object and hand it counter and gauge
//! updates. The Prometheus-backed implementation pushes every update onto
//! an unbounded channel drained by a background task, so emission never
//! blocks the read/write path of a connection.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::error::{LinkmuxError, LinkmuxResult};
use crate::source::{DataFlow, FlowKind};

/// Receives the counters and gauges emitted by the core.
pub trait MetricsExporter: Send + Sync {
    /// Network usage update for one read or write operation.
    fn send_data_flow(&self, source: &str, target: &str, flow: &DataFlow);

    /// A source was chosen to serve a connection.
    fn inc_selected_source(&self, source: &str, target: &str);

    /// Open connection count change (+1 on dial, -1 on close).
    fn count_open_conn(&self, source: &str, target: &str, delta: i64);

    /// First-write to first-read latency of a connection.
    fn add_latency(&self, source: &str, target: &str, latency: Duration);

    /// Remote-port usage change, keyed by port and protocol.
    fn count_port(&self, port: u16, protocol: &str, delta: i64);
}

/// Exporter that drops every update. Used in tests and as a default.
pub struct NoopExporter;

impl MetricsExporter for NoopExporter {
    fn send_data_flow(&self, _source: &str, _target: &str, _flow: &DataFlow) {}
    fn inc_selected_source(&self, _source: &str, _target: &str) {}
    fn count_open_conn(&self, _source: &str, _target: &str, _delta: i64) {}
    fn add_latency(&self, _source: &str, _target: &str, _latency: Duration) {}
    fn count_port(&self, _port: u16, _protocol: &str, _delta: i64) {}
}

enum MetricEvent {
    DataFlow {
        source: String,
        target: String,
        kind: FlowKind,
        bytes: u64,
    },
    SelectedSource {
        source: String,
        target: String,
    },
    OpenConn {
        source: String,
        target: String,
        delta: i64,
    },
    Latency {
        source: String,
        target: String,
        ms: f64,
    },
    Port {
        port: u16,
        protocol: String,
        delta: i64,
    },
}

/// Prometheus-backed exporter.
///
/// Construction spawns the drain task, so it must happen inside a tokio
/// runtime. The recorder itself is process-global; see
/// [`install_recorder`].
pub struct PrometheusExporter {
    tx: mpsc::UnboundedSender<MetricEvent>,
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusExporter {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                apply(event);
            }
        });
        Self { tx }
    }

    fn push(&self, event: MetricEvent) {
        // Receiver only goes away at shutdown; losing late events is fine.
        let _ = self.tx.send(event);
    }
}

impl MetricsExporter for PrometheusExporter {
    fn send_data_flow(&self, source: &str, target: &str, flow: &DataFlow) {
        self.push(MetricEvent::DataFlow {
            source: source.to_string(),
            target: target.to_string(),
            kind: flow.kind,
            bytes: flow.bytes,
        });
    }

    fn inc_selected_source(&self, source: &str, target: &str) {
        self.push(MetricEvent::SelectedSource {
            source: source.to_string(),
            target: target.to_string(),
        });
    }

    fn count_open_conn(&self, source: &str, target: &str, delta: i64) {
        self.push(MetricEvent::OpenConn {
            source: source.to_string(),
            target: target.to_string(),
            delta,
        });
    }

    fn add_latency(&self, source: &str, target: &str, latency: Duration) {
        self.push(MetricEvent::Latency {
            source: source.to_string(),
            target: target.to_string(),
            ms: latency.as_secs_f64() * 1000.0,
        });
    }

    fn count_port(&self, port: u16, protocol: &str, delta: i64) {
        self.push(MetricEvent::Port {
            port,
            protocol: protocol.to_string(),
            delta,
        });
    }
}

fn apply(event: MetricEvent) {
    match event {
        MetricEvent::DataFlow {
            source,
            target,
            kind,
            bytes,
        } => {
            let name = match kind {
                FlowKind::Read => "network_receive_bytes",
                FlowKind::Write => "network_send_bytes",
            };
            metrics::gauge!(name, "source" => source, "target" => target).increment(bytes as f64);
        }
        MetricEvent::SelectedSource { source, target } => {
            metrics::counter!("select_source_total", "source" => source, "target" => target)
                .increment(1);
        }
        MetricEvent::OpenConn {
            source,
            target,
            delta,
        } => {
            metrics::gauge!("open_conn_count", "source" => source, "target" => target)
                .increment(delta as f64);
        }
        MetricEvent::Latency { source, target, ms } => {
            metrics::gauge!("conn_latency_ms", "source" => source, "target" => target)
                .increment(ms);
        }
        MetricEvent::Port {
            port,
            protocol,
            delta,
        } => {
            metrics::gauge!("port_count", "port" => port.to_string(), "protocol" => protocol)
                .increment(delta as f64);
        }
    }
}

/// Install the process-global Prometheus recorder and describe the core
/// metric families. Call once at startup, before any metric is emitted.
pub fn install_recorder() -> LinkmuxResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| LinkmuxError::config(format!("failed to install metrics recorder: {}", e)))?;

    metrics::describe_gauge!("network_send_bytes", "Sent bytes for network source");
    metrics::describe_gauge!("network_receive_bytes", "Received bytes for network source");
    metrics::describe_counter!("select_source_total", "Number of times a source was chosen");
    metrics::describe_gauge!("open_conn_count", "Number of open connections");
    metrics::describe_gauge!("conn_latency_ms", "Latency value measured in milliseconds");
    metrics::describe_gauge!("port_count", "Number of times a port is being used");

    Ok(handle)
}

/// Serve the rendered Prometheus exposition on `/metrics`.
pub async fn run_metrics_server(
    port: u16,
    handle: PrometheusHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> LinkmuxResult<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let make_svc = make_service_fn(move |_conn| {
        let handle = handle.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let handle = handle.clone();
                async move { Ok::<_, Infallible>(render(req, &handle)) }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("Metrics server shutting down");
        });

    server.await.map_err(|e| {
        error!("Metrics server error: {}", e);
        e.into()
    })
}

fn render(req: Request<Body>, handle: &PrometheusHandle) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::new(Body::from(handle.render())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found"))
            .unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_exporter_does_not_block() {
        // No recorder installed: updates land in the global no-op recorder.
        let exporter = PrometheusExporter::new();
        let now = Instant::now();
        let flow = DataFlow {
            kind: FlowKind::Write,
            started_at: now,
            ended_at: now,
            bytes: 42,
            avg_bytes_per_second: 42.0,
        };
        exporter.send_data_flow("en0", "example.com:443", &flow);
        exporter.inc_selected_source("en0", "example.com:443");
        exporter.count_open_conn("en0", "example.com:443", 1);
        exporter.add_latency("en0", "example.com:443", Duration::from_millis(12));
        exporter.count_port(443, "tcp4", 1);
    }
}
