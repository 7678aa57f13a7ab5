use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::metrics::MetricsExporter;

/// Direction of a [`DataFlow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Read,
    Write,
}

/// Usage record produced for every read or write that moves at least one
/// byte.
#[derive(Debug, Clone)]
pub struct DataFlow {
    pub kind: FlowKind,
    pub started_at: Instant,
    pub ended_at: Instant,
    pub bytes: u64,
    pub avg_bytes_per_second: f64,
}

impl DataFlow {
    fn record(kind: FlowKind, bytes: u64, started_at: Instant) -> Self {
        let ended_at = Instant::now();
        let elapsed = ended_at.duration_since(started_at).as_secs_f64();
        Self {
            kind,
            started_at,
            ended_at,
            bytes,
            avg_bytes_per_second: bytes as f64 / elapsed.max(1e-9),
        }
    }
}

/// Registry entry for a live connection. The watcher is a handle onto the
/// same socket, kept so the owning interface can sever the connection
/// without owning the stream.
pub(crate) struct ConnEntry {
    pub(crate) watcher: std::net::TcpStream,
    #[allow(dead_code)]
    pub(crate) remote: SocketAddr,
}

pub(crate) type ConnRegistry = Arc<Mutex<HashMap<u64, ConnEntry>>>;

/// Bookkeeping shared between a [`TrackedConn`] and its parent interface.
pub(crate) struct ConnState {
    pub(crate) id: u64,
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) remote_port: u16,
    pub(crate) network: String,
    pub(crate) exporter: Option<Arc<dyn MetricsExporter>>,
    pub(crate) registry: ConnRegistry,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    first_write: Mutex<Option<Instant>>,
    latency_sent: AtomicBool,
    closed: AtomicBool,
}

impl ConnState {
    pub(crate) fn new(
        id: u64,
        source: String,
        target: String,
        remote_port: u16,
        network: String,
        exporter: Option<Arc<dyn MetricsExporter>>,
        registry: ConnRegistry,
    ) -> Self {
        Self {
            id,
            source,
            target,
            remote_port,
            network,
            exporter,
            registry,
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            first_write: Mutex::new(None),
            latency_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn record_read(&self, bytes: u64, started_at: Instant) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);

        let flow = DataFlow::record(FlowKind::Read, bytes, started_at);
        if let Some(exporter) = &self.exporter {
            exporter.send_data_flow(&self.source, &self.target, &flow);

            // First read completing after the first write closes the
            // round-trip latency window.
            let first_write = *self.first_write.lock().unwrap();
            if let Some(marker) = first_write {
                if !self.latency_sent.swap(true, Ordering::SeqCst) {
                    exporter.add_latency(&self.source, &self.target, flow.ended_at - marker);
                }
            }
        }
    }

    fn record_write(&self, bytes: u64, started_at: Instant) {
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);

        let mut first_write = self.first_write.lock().unwrap();
        if first_write.is_none() {
            *first_write = Some(started_at);
        }
        drop(first_write);

        if let Some(exporter) = &self.exporter {
            let flow = DataFlow::record(FlowKind::Write, bytes, started_at);
            exporter.send_data_flow(&self.source, &self.target, &flow);
        }
    }

    /// Run the close bookkeeping exactly once: gauge decrements and
    /// removal from the parent registry. Subsequent calls are no-ops.
    pub(crate) fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(exporter) = &self.exporter {
            exporter.count_open_conn(&self.source, &self.target, -1);
            exporter.count_port(self.remote_port, &self.network, -1);
        }
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.id);
        }
    }
}

/// A connection adorned with byte counters, a first-write-to-first-read
/// latency marker, metric hooks and a close-once guard.
pub struct TrackedConn<S> {
    inner: S,
    state: Arc<ConnState>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for TrackedConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConn")
            .field("inner", &self.inner)
            .field("source_id", &self.state.source)
            .finish()
    }
}

impl<S> TrackedConn<S> {
    pub(crate) fn new(inner: S, state: Arc<ConnState>) -> Self {
        Self { inner, state }
    }

    pub fn source_id(&self) -> &str {
        &self.state.source
    }

    pub fn bytes_read(&self) -> u64 {
        self.state.read_bytes.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.write_bytes.load(Ordering::Relaxed)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let started_at = Instant::now();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                if n > 0 {
                    this.state.record_read(n, started_at);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let started_at = Instant::now();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.state.record_write(n as u64, started_at);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.state.finish();
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for TrackedConn<S> {
    fn drop(&mut self) {
        // Multiple parts of the code might try to close the connection;
        // the state guard makes sure the bookkeeping runs only once.
        self.state.finish();
    }
}
