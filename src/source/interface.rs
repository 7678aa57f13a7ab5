use std::fmt;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

use crate::core::{BoxConn, Source};
use crate::error::{LinkmuxError, LinkmuxResult};
use crate::metrics::MetricsExporter;
use crate::source::bind;
use crate::source::conn::{ConnEntry, ConnRegistry, ConnState, TrackedConn};

/// Callback invoked each time a source fails to create a connection.
/// Arguments: source id, network, address, error.
pub type DialHook = Arc<dyn Fn(&str, &str, &str, &LinkmuxError) + Send + Sync>;

/// A [`Source`] backed by an OS network interface: it provides network
/// connections through the device it refers to, and keeps track of the
/// live ones so they can be severed and counted.
pub struct NetInterface {
    name: String,
    hw_addr: Option<String>,
    addrs: Vec<IpAddr>,
    on_dial_err: Mutex<Option<DialHook>>,
    exporter: Mutex<Option<Arc<dyn MetricsExporter>>>,
    conns: ConnRegistry,
    next_conn_id: AtomicU64,
}

impl NetInterface {
    pub fn new(name: impl Into<String>, hw_addr: Option<String>, addrs: Vec<IpAddr>) -> Self {
        Self {
            name: name.into(),
            hw_addr,
            addrs,
            on_dial_err: Mutex::new(None),
            exporter: Mutex::new(None),
            conns: Arc::new(Mutex::new(Default::default())),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Hardware address as reported by the OS, if any.
    pub fn hw_addr(&self) -> Option<&str> {
        self.hw_addr.as_deref()
    }

    /// Unicast addresses assigned to the interface.
    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }

    pub fn set_dial_hook(&self, hook: DialHook) {
        *self.on_dial_err.lock().unwrap() = Some(hook);
    }

    pub fn set_metrics_exporter(&self, exporter: Arc<dyn MetricsExporter>) {
        *self.exporter.lock().unwrap() = Some(exporter);
    }

    fn exporter(&self) -> Option<Arc<dyn MetricsExporter>> {
        self.exporter.lock().unwrap().clone()
    }

    /// Resolve `address` and keep only the candidates the requested
    /// network allows.
    async fn resolve(&self, network: &str, address: &str) -> LinkmuxResult<SocketAddr> {
        let candidates = lookup_host(address)
            .await
            .map_err(|e| LinkmuxError::dial(&self.name, address, e.to_string()))?;

        candidates
            .into_iter()
            .find(|addr| match network {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            })
            .ok_or_else(|| {
                LinkmuxError::dial(
                    &self.name,
                    address,
                    format!("no address suitable for network {}", network),
                )
            })
    }

    async fn dial_bound(&self, network: &str, address: &str) -> LinkmuxResult<BoxConn> {
        let remote = self.resolve(network, address).await?;

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| LinkmuxError::dial(&self.name, address, e.to_string()))?;

        bind::bind_to_interface(&socket, &self.name, &self.addrs)?;

        let stream = socket
            .connect(remote)
            .await
            .map_err(|e| LinkmuxError::dial(&self.name, address, e.to_string()))?;

        self.track(stream, remote, network, address)
    }

    /// Wrap a freshly dialed stream and add it to the set of connections
    /// the interface is handling.
    fn track(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        network: &str,
        address: &str,
    ) -> LinkmuxResult<BoxConn> {
        let std_stream = stream
            .into_std()
            .map_err(|e| LinkmuxError::dial(&self.name, address, e.to_string()))?;
        let watcher = std_stream
            .try_clone()
            .map_err(|e| LinkmuxError::dial(&self.name, address, e.to_string()))?;
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| LinkmuxError::dial(&self.name, address, e.to_string()))?;

        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        self.conns
            .lock()
            .unwrap()
            .insert(id, ConnEntry { watcher, remote });

        let exporter = self.exporter();
        if let Some(exporter) = &exporter {
            exporter.count_open_conn(&self.name, address, 1);
            exporter.count_port(remote.port(), network, 1);
        }

        debug!(
            "Opening connection (ref: {}) to {}, tracking {}",
            self.name,
            remote,
            self.conns.lock().unwrap().len()
        );

        let state = Arc::new(ConnState::new(
            id,
            self.name.clone(),
            address.to_string(),
            remote.port(),
            network.to_string(),
            exporter,
            self.conns.clone(),
        ));

        Ok(Box::new(TrackedConn::new(stream, state)))
    }
}

#[async_trait]
impl Source for NetInterface {
    fn id(&self) -> &str {
        &self.name
    }

    async fn dial(&self, network: &str, address: &str) -> LinkmuxResult<BoxConn> {
        match self.dial_bound(network, address).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                let hook = self.on_dial_err.lock().unwrap().clone();
                if let Some(hook) = hook {
                    hook(self.id(), network, address, &err);
                }
                Err(err)
            }
        }
    }

    fn close(&self) {
        // Sever every tracked socket; the wrappers notice on their next
        // poll and run the close bookkeeping themselves, exactly once.
        let conns = self.conns.lock().unwrap();
        for entry in conns.values() {
            let _ = entry.watcher.shutdown(Shutdown::Both);
        }
    }

    fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

impl fmt::Display for NetInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
