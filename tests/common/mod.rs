//! Shared test doubles for the integration suites.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use linkmux::core::{BoxConn, Source};
use linkmux::error::{LinkmuxError, LinkmuxResult};
use linkmux::metrics::MetricsExporter;
use linkmux::source::DataFlow;

/// In-memory source: dials succeed with a loopback duplex pipe while
/// `active`, fail otherwise.
pub struct MockSource {
    id: String,
    active: AtomicBool,
    dials: AtomicUsize,
    peers: Mutex<Vec<tokio::io::DuplexStream>>,
}

impl MockSource {
    pub fn new(id: &str, active: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            active: AtomicBool::new(active),
            dials: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn active(id: &str) -> Arc<Self> {
        Self::new(id, true)
    }

    pub fn inactive(id: &str) -> Arc<Self> {
        Self::new(id, false)
    }

    #[allow(dead_code)]
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn dial(&self, _network: &str, address: &str) -> LinkmuxResult<BoxConn> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.active.load(Ordering::SeqCst) {
            return Err(LinkmuxError::dial(
                &self.id,
                address,
                "no internet connection",
            ));
        }
        let (near, far) = tokio::io::duplex(1024);
        self.peers.lock().unwrap().push(far);
        Ok(Box::new(near))
    }

    fn close(&self) {
        self.peers.lock().unwrap().clear();
    }

    fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

/// Exporter that remembers every selection it sees.
#[derive(Default)]
pub struct SelectionRecorder {
    pub selected: Mutex<Vec<(String, String)>>,
}

impl MetricsExporter for SelectionRecorder {
    fn send_data_flow(&self, _source: &str, _target: &str, _flow: &DataFlow) {}

    fn inc_selected_source(&self, source: &str, target: &str) {
        self.selected
            .lock()
            .unwrap()
            .push((source.to_string(), target.to_string()));
    }

    fn count_open_conn(&self, _source: &str, _target: &str, _delta: i64) {}

    fn add_latency(&self, _source: &str, _target: &str, _latency: Duration) {}

    fn count_port(&self, _port: u16, _protocol: &str, _delta: i64) {}
}
