use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::core::BoxConn;
use crate::error::{LinkmuxError, LinkmuxResult};
use crate::metrics::MetricsExporter;
use crate::store::SourceStore;

/// Dials network connections through sources retrieved from the store,
/// failing over across sources until exhaustion.
pub struct Dialer {
    store: Arc<SourceStore>,
    exporter: Mutex<Option<Arc<dyn MetricsExporter>>>,
}

impl Dialer {
    pub fn new(store: Arc<SourceStore>) -> Self {
        Self {
            store,
            exporter: Mutex::new(None),
        }
    }

    pub fn set_metrics_exporter(&self, exporter: Arc<dyn MetricsExporter>) {
        *self.exporter.lock().unwrap() = Some(exporter);
    }

    /// Number of sources the dialer has at its disposal.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Dial a connection to `address` through a dynamically chosen source.
    ///
    /// When a dial fails the source is blacklisted for this request and
    /// another one is tried, until every source in the registry has been
    /// attempted; only the last error is returned then. A store error
    /// aborts immediately: there is no source left to use.
    pub async fn dial_context(&self, address: &str) -> LinkmuxResult<BoxConn> {
        let mut blacklist: Vec<String> = Vec::with_capacity(self.len());
        let mut last_err = None;
        let mut attempt = 0;

        while blacklist.len() < self.len() {
            let source = self.store.get(address, &blacklist)?;
            self.send_selected(source.id(), address);

            debug!(
                "DialContext: attempt #{} to connect to {} (source {})",
                attempt,
                address,
                source.id()
            );

            match source.dial("tcp4", address).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    error!(
                        "Unable to dial connection to {} using source {}: {}",
                        address,
                        source.id(),
                        err
                    );
                    blacklist.push(source.id().to_string());
                    last_err = Some(err);
                }
            }
            attempt += 1;
        }

        Err(last_err.unwrap_or(LinkmuxError::EmptyRegistry))
    }

    fn send_selected(&self, source: &str, target: &str) {
        let exporter = self.exporter.lock().unwrap();
        if let Some(exporter) = exporter.as_ref() {
            exporter.inc_selected_source(source, target);
        }
    }
}
