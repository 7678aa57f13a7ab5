use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::core::Source;
use crate::error::LinkmuxResult;
use crate::metrics::MetricsExporter;
use crate::source::interface::DialHook;
use crate::source::provider::{Confidence, LocalProvider, SourceProvider};
use crate::store::SourceStore;

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// The most recent dial failure observed for a source.
#[derive(Debug, Clone)]
pub struct HookErr {
    pub received_at: Instant,
    pub source: String,
    pub network: String,
    pub address: String,
    pub message: String,
}

impl fmt::Display for HookErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error {} produced by source {} while contacting {} using {}",
            self.message, self.source, self.address, self.network
        )
    }
}

/// Collects dial-time errors, one entry per source id, last writer wins.
#[derive(Default)]
pub struct Hooker {
    hooked: Mutex<HashMap<String, HookErr>>,
}

impl Hooker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_dial_err(&self, source: &str, network: &str, address: &str, message: String) {
        debug!(
            "Hooker: dial error from {} (net: {}, addr: {}): {}",
            source, network, address, message
        );

        let err = HookErr {
            received_at: Instant::now(),
            source: source.to_string(),
            network: network.to_string(),
            address: address.to_string(),
            message,
        };
        self.hooked.lock().unwrap().insert(err.source.clone(), err);
    }

    /// Remove and return the pending error for `id`; the error must be
    /// handled by the caller once taken.
    pub fn take(&self, id: &str) -> Option<HookErr> {
        self.hooked.lock().unwrap().remove(id)
    }
}

/// Computes what has to be added to and removed from `old` to obtain the
/// same id-set as `cur`.
pub fn diff(
    old: &[Arc<dyn Source>],
    cur: &[Arc<dyn Source>],
) -> (Vec<Arc<dyn Source>>, Vec<Arc<dyn Source>>) {
    let old_ids: HashMap<&str, ()> = old.iter().map(|s| (s.id(), ())).collect();
    let cur_ids: HashMap<&str, ()> = cur.iter().map(|s| (s.id(), ())).collect();

    let add = cur
        .iter()
        .filter(|s| !old_ids.contains_key(s.id()))
        .cloned()
        .collect();
    let remove = old
        .iter()
        .filter(|s| !cur_ids.contains_key(s.id()))
        .cloned()
        .collect();

    (add, remove)
}

/// Keeps the store reconciled with the live interface inventory.
///
/// Each poll diffs the provider's current view against the store, gates
/// new sources behind a High-confidence probe, drops the ones the OS no
/// longer reports, and re-probes any stored source whose dial hook
/// reported an error since the last poll.
pub struct Listener {
    provider: Arc<dyn SourceProvider>,
    store: Arc<SourceStore>,
    hooker: Arc<Hooker>,
}

impl Listener {
    /// Listener over the local machine's interfaces. Every interface the
    /// provider hands out feeds its dial failures back into this
    /// listener's hooker.
    pub fn new(
        store: Arc<SourceStore>,
        exporter: Arc<dyn MetricsExporter>,
        probe_target: impl Into<String>,
    ) -> Self {
        let hooker = Arc::new(Hooker::new());

        let hook: DialHook = {
            let hooker = hooker.clone();
            Arc::new(move |source, network, address, err| {
                hooker.handle_dial_err(source, network, address, err.to_string());
            })
        };

        let provider = LocalProvider::new(probe_target)
            .with_dial_hook(hook)
            .with_metrics_exporter(exporter);

        Self {
            provider: Arc::new(provider),
            store,
            hooker,
        }
    }

    /// Listener over a custom provider. Dial errors are only observed if
    /// the provider wires its sources to `hooker`.
    pub fn with_provider(
        store: Arc<SourceStore>,
        provider: Arc<dyn SourceProvider>,
        hooker: Arc<Hooker>,
    ) -> Self {
        Self {
            provider,
            store,
            hooker,
        }
    }

    fn stored_sources(&self) -> Vec<Arc<dyn Source>> {
        let mut acc = Vec::with_capacity(self.store.len());
        self.store.for_each(|s| acc.push(s.clone()));
        acc
    }

    /// One reconciliation pass. Only provider enumeration failures are
    /// surfaced; per-source probe failures just keep that source out.
    pub async fn poll(&self) -> LinkmuxResult<()> {
        let cur = self.provider.provide().await?;
        let old = self.stored_sources();

        let (add, remove) = diff(&old, &cur);

        // Inspect the new ones; admission requires an active connection.
        for source in add {
            debug!("Poll: considering {}", source.id());
            if let Err(e) = self.provider.check(&source, Confidence::High).await {
                debug!("Poll: unable to add source: {}", e);
                continue;
            }
            info!("Listener: adding {} to the store", source.id());
            self.store.put(&[source]);
        }

        // Remove what the OS no longer reports, without further
        // investigation, consuming any pending hook error.
        for source in remove {
            info!("Listener: removing {} from the store", source.id());
            self.store.del(std::slice::from_ref(&source));
            source.close();
            let _ = self.hooker.take(source.id());
        }

        // Re-probe the stored sources that failed a dial since the last
        // poll; a hook error alone does not prove the source is dead.
        for source in self.stored_sources() {
            let Some(err) = self.hooker.take(source.id()) else {
                continue;
            };
            warn!("Listener: {}", err);
            if self.provider.check(&source, Confidence::High).await.is_err() {
                info!(
                    "Listener: removing {} from the store after hook error",
                    source.id()
                );
                self.store.del(std::slice::from_ref(&source));
                source.close();
            }
        }

        Ok(())
    }

    /// Keep polling until the shutdown channel fires. Poll errors are
    /// logged and the loop continues.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> LinkmuxResult<()> {
        loop {
            match timeout(POLL_TIMEOUT, self.poll()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener poll failed: {}", e),
                Err(_) => error!("Listener poll timed out"),
            }

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock::MockSource;
    use async_trait::async_trait;

    struct MockProvider {
        sources: Mutex<Vec<Arc<MockSource>>>,
    }

    impl MockProvider {
        fn new(sources: Vec<Arc<MockSource>>) -> Arc<Self> {
            Arc::new(Self {
                sources: Mutex::new(sources),
            })
        }

        fn set_sources(&self, sources: Vec<Arc<MockSource>>) {
            *self.sources.lock().unwrap() = sources;
        }
    }

    #[async_trait]
    impl SourceProvider for MockProvider {
        async fn provide(&self) -> LinkmuxResult<Vec<Arc<dyn Source>>> {
            Ok(self
                .sources
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.clone() as Arc<dyn Source>)
                .collect())
        }

        async fn check(
            &self,
            source: &Arc<dyn Source>,
            confidence: Confidence,
        ) -> LinkmuxResult<()> {
            match confidence {
                Confidence::Low => Ok(()),
                Confidence::High => source.dial("tcp", "probe:80").await.map(|_| ()),
            }
        }
    }

    fn stored_ids(store: &SourceStore) -> Vec<String> {
        let mut ids = Vec::new();
        store.for_each(|s| ids.push(s.id().to_string()));
        ids.sort();
        ids
    }

    #[test]
    fn test_diff() {
        let old: Vec<Arc<dyn Source>> = vec![
            Arc::new(MockSource::active("en0")),
            Arc::new(MockSource::active("awl0")),
        ];
        let cur: Vec<Arc<dyn Source>> = vec![
            Arc::new(MockSource::active("en0")),
            Arc::new(MockSource::active("en4")),
        ];

        let (add, remove) = diff(&old, &cur);
        assert_eq!(add.len(), 1);
        assert_eq!(add[0].id(), "en4");
        assert_eq!(remove.len(), 1);
        assert_eq!(remove[0].id(), "awl0");
    }

    #[tokio::test]
    async fn test_poll_reconciles_inventory() {
        let en0 = Arc::new(MockSource::active("en0"));
        let awl0 = Arc::new(MockSource::inactive("awl0"));

        let provider = MockProvider::new(vec![en0.clone(), awl0.clone()]);
        let store = Arc::new(SourceStore::new());
        let listener =
            Listener::with_provider(store.clone(), provider.clone(), Arc::new(Hooker::new()));

        // awl0 fails its High-confidence probe and stays out.
        listener.poll().await.unwrap();
        assert_eq!(stored_ids(&store), vec!["en0"]);

        // It is still absent from the store, so the next poll diffs it as
        // an addition again; now the probe passes and it gets in.
        awl0.set_active(true);
        listener.poll().await.unwrap();
        assert_eq!(stored_ids(&store), vec!["awl0", "en0"]);

        // Removal needs no probe at all.
        provider.set_sources(vec![en0.clone()]);
        listener.poll().await.unwrap();
        assert_eq!(stored_ids(&store), vec!["en0"]);
    }

    #[tokio::test]
    async fn test_poll_reprobes_hooked_sources() {
        let en0 = Arc::new(MockSource::active("en0"));
        let provider = MockProvider::new(vec![en0.clone()]);
        let store = Arc::new(SourceStore::new());
        let hooker = Arc::new(Hooker::new());
        let listener = Listener::with_provider(store.clone(), provider.clone(), hooker.clone());

        listener.poll().await.unwrap();
        assert_eq!(stored_ids(&store), vec!["en0"]);

        // A hook error with a passing re-probe leaves the source in.
        hooker.handle_dial_err("en0", "tcp4", "x:1", "connection reset".to_string());
        listener.poll().await.unwrap();
        assert_eq!(stored_ids(&store), vec!["en0"]);
        assert!(hooker.take("en0").is_none());

        // A hook error with a failing re-probe evicts it.
        hooker.handle_dial_err("en0", "tcp4", "x:1", "connection reset".to_string());
        en0.set_active(false);
        listener.poll().await.unwrap();
        assert!(stored_ids(&store).is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let provider = MockProvider::new(vec![]);
        let store = Arc::new(SourceStore::new());
        let listener = Listener::with_provider(store, provider, Arc::new(Hooker::new()));

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { listener.run(rx).await });

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run took too long to return")
            .unwrap();
        assert!(result.is_ok());
    }
}
