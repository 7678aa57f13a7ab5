//! Listener reconciliation against a scripted provider.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use common::MockSource;
use linkmux::core::Source;
use linkmux::error::LinkmuxResult;
use linkmux::source::{Confidence, Hooker, Listener, SourceProvider};
use linkmux::store::SourceStore;

struct ScriptedProvider {
    sources: Mutex<Vec<Arc<MockSource>>>,
}

impl ScriptedProvider {
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
impl SourceProvider for ScriptedProvider {
    async fn provide(&self) -> LinkmuxResult<Vec<Arc<dyn Source>>> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.clone() as Arc<dyn Source>)
            .collect())
    }

    async fn check(&self, source: &Arc<dyn Source>, confidence: Confidence) -> LinkmuxResult<()> {
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

#[tokio::test]
async fn poll_tracks_the_inventory() {
    let en0 = MockSource::active("en0");
    let awl0 = MockSource::inactive("awl0");

    let provider = ScriptedProvider::new(vec![en0.clone(), awl0.clone()]);
    let store = Arc::new(SourceStore::new());
    let listener = Listener::with_provider(store.clone(), provider.clone(), Arc::new(Hooker::new()));

    // The inactive interface fails its admission probe.
    listener.poll().await.unwrap();
    assert_eq!(stored_ids(&store), vec!["en0"]);

    // It is still absent from the store, so the next poll considers it
    // again; the probe passes now and it gets in.
    awl0.set_active(true);
    listener.poll().await.unwrap();
    assert_eq!(stored_ids(&store), vec!["awl0", "en0"]);

    // Removal needs no probe at all.
    provider.set_sources(vec![en0]);
    listener.poll().await.unwrap();
    assert_eq!(stored_ids(&store), vec!["en0"]);
}

#[tokio::test]
async fn hook_error_triggers_reprobe_and_eviction() {
    let en0 = MockSource::active("en0");
    let provider = ScriptedProvider::new(vec![en0.clone()]);
    let store = Arc::new(SourceStore::new());
    let hooker = Arc::new(Hooker::new());
    let listener = Listener::with_provider(store.clone(), provider, hooker.clone());

    listener.poll().await.unwrap();
    assert_eq!(stored_ids(&store), vec!["en0"]);

    // Transient failure: the re-probe passes and the source stays.
    hooker.handle_dial_err("en0", "tcp4", "x:1", "connection reset".to_string());
    listener.poll().await.unwrap();
    assert_eq!(stored_ids(&store), vec!["en0"]);

    // Dead link: the re-probe fails and the source is evicted.
    hooker.handle_dial_err("en0", "tcp4", "x:1", "connection reset".to_string());
    en0.set_active(false);
    listener.poll().await.unwrap();
    assert!(stored_ids(&store).is_empty());
}

#[tokio::test]
async fn run_returns_only_on_shutdown() {
    let provider = ScriptedProvider::new(vec![]);
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
