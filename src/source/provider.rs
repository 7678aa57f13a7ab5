use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::core::Source;
use crate::error::{LinkmuxError, LinkmuxResult};
use crate::metrics::MetricsExporter;
use crate::source::interface::{DialHook, NetInterface};

/// Probe tier. `Low` runs structural checks only; `High` also requires an
/// active network connection through the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    High,
}

pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub(crate) const PROBE_BACKOFF: Duration = Duration::from_millis(500);
pub(crate) const PROBE_ATTEMPTS: usize = 3;

/// A service capable of providing sources and checking their effective
/// internet connection using a defined level of confidence.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn provide(&self) -> LinkmuxResult<Vec<Arc<dyn Source>>>;
    async fn check(&self, source: &Arc<dyn Source>, confidence: Confidence) -> LinkmuxResult<()>;
}

/// Snapshot of one OS interface, as used by the structural checks.
#[derive(Debug, Clone)]
pub struct InterfaceData {
    pub name: String,
    pub hw_addr: Option<String>,
    pub addrs: Vec<IpAddr>,
}

type Check = fn(&InterfaceData) -> LinkmuxResult<()>;

const STRUCTURAL_CHECKS: &[Check] = &[has_hardware_addr, has_ip];

fn pipeline(data: &InterfaceData, checks: &[Check]) -> LinkmuxResult<()> {
    for check in checks {
        check(data)?;
    }
    Ok(())
}

fn has_hardware_addr(data: &InterfaceData) -> LinkmuxResult<()> {
    let missing = match data.hw_addr.as_deref() {
        None | Some("") => true,
        // Loopback and some virtual devices report an all-zero address.
        Some(mac) => mac.bytes().all(|b| b == b'0' || b == b':'),
    };
    if missing {
        return Err(LinkmuxError::probe(
            &data.name,
            format!("interface {} does not have a valid hardware address", data.name),
        ));
    }
    Ok(())
}

fn has_ip(data: &InterfaceData) -> LinkmuxResult<()> {
    if data.addrs.is_empty() {
        return Err(LinkmuxError::probe(
            &data.name,
            format!(
                "neither a valid IPv4 nor IPv6 was found in interface {}",
                data.name
            ),
        ));
    }
    Ok(())
}

/// Provider that enumerates the interfaces of the local machine.
pub struct LocalProvider {
    probe_target: String,
    dial_hook: Option<DialHook>,
    exporter: Option<Arc<dyn MetricsExporter>>,
}

impl LocalProvider {
    /// `probe_target` is the `host:port` dialed by High-confidence checks,
    /// purely as a reachability signal.
    pub fn new(probe_target: impl Into<String>) -> Self {
        Self {
            probe_target: probe_target.into(),
            dial_hook: None,
            exporter: None,
        }
    }

    /// Install `hook` on every interface this provider hands out.
    pub fn with_dial_hook(mut self, hook: DialHook) -> Self {
        self.dial_hook = Some(hook);
        self
    }

    /// Install `exporter` on every interface this provider hands out.
    pub fn with_metrics_exporter(mut self, exporter: Arc<dyn MetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    fn enumerate(&self) -> LinkmuxResult<Vec<InterfaceData>> {
        let interfaces = NetworkInterface::show()
            .map_err(|e| LinkmuxError::network(format!("unable to get interfaces: {}", e)))?;

        Ok(interfaces
            .into_iter()
            .map(|ifi| InterfaceData {
                name: ifi.name,
                hw_addr: ifi.mac_addr,
                addrs: ifi
                    .addr
                    .iter()
                    .map(|addr| match addr {
                        Addr::V4(v4) => IpAddr::V4(v4.ip),
                        Addr::V6(v6) => IpAddr::V6(v6.ip),
                    })
                    .collect(),
            })
            .collect())
    }

    fn wrap(&self, data: InterfaceData) -> Arc<NetInterface> {
        let ifi = NetInterface::new(data.name, data.hw_addr, data.addrs);
        if let Some(hook) = &self.dial_hook {
            ifi.set_dial_hook(hook.clone());
        }
        if let Some(exporter) = &self.exporter {
            ifi.set_metrics_exporter(exporter.clone());
        }
        Arc::new(ifi)
    }

    async fn has_network_conn(&self, source: &Arc<dyn Source>) -> LinkmuxResult<()> {
        let dial = source.dial("tcp", &self.probe_target);
        let conn = timeout(PROBE_TIMEOUT, dial)
            .await
            .map_err(|_| {
                LinkmuxError::probe(
                    source.id(),
                    format!("probe dial to {} timed out", self.probe_target),
                )
            })?
            .map_err(|e| LinkmuxError::probe(source.id(), e.to_string()))?;

        // The dial itself is the signal; no data is exchanged.
        drop(conn);
        Ok(())
    }

    async fn has_network_conn_retry(&self, source: &Arc<dyn Source>) -> LinkmuxResult<()> {
        for attempt in 0..PROBE_ATTEMPTS {
            if attempt == PROBE_ATTEMPTS - 1 {
                // Last attempt: surface its outcome directly.
                return self.has_network_conn(source).await;
            }

            if self.has_network_conn(source).await.is_ok() {
                return Ok(());
            }

            sleep(PROBE_BACKOFF).await;
        }
        unreachable!("probe retry loop returns on its last attempt")
    }
}

#[async_trait]
impl SourceProvider for LocalProvider {
    /// Enumerate the local interfaces, keeping only those that pass the
    /// Low-confidence pipeline. Each returned source already carries the
    /// provider's dial hook and metrics exporter.
    async fn provide(&self) -> LinkmuxResult<Vec<Arc<dyn Source>>> {
        let mut sources: Vec<Arc<dyn Source>> = Vec::new();
        for data in self.enumerate()? {
            if let Err(e) = pipeline(&data, STRUCTURAL_CHECKS) {
                debug!("Local provider: skipping interface: {}", e);
                continue;
            }
            sources.push(self.wrap(data));
        }
        Ok(sources)
    }

    async fn check(
        &self,
        source: &Arc<dyn Source>,
        confidence: Confidence,
    ) -> LinkmuxResult<()> {
        let data = self
            .enumerate()?
            .into_iter()
            .find(|data| data.name == source.id())
            .ok_or_else(|| {
                LinkmuxError::probe(source.id(), "interface is no longer reported by the OS")
            })?;

        pipeline(&data, STRUCTURAL_CHECKS)?;

        if confidence == Confidence::High {
            self.has_network_conn_retry(source).await?;
        }
        Ok(())
    }
}
