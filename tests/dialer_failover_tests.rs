//! Dialer failover across sources, driven through the public API.

mod common;

use std::sync::Arc;

use common::{MockSource, SelectionRecorder};
use linkmux::core::Source;
use linkmux::dialer::Dialer;
use linkmux::error::LinkmuxError;
use linkmux::store::{BlockPolicy, SourceStore};

#[tokio::test]
async fn failover_until_a_source_succeeds() {
    let s0 = MockSource::inactive("s0");
    let s1 = MockSource::active("s1");

    let store = Arc::new(SourceStore::new());
    store.put(&[s0.clone() as Arc<dyn Source>, s1.clone() as Arc<dyn Source>]);

    let dialer = Dialer::new(store);
    let recorder = Arc::new(SelectionRecorder::default());
    dialer.set_metrics_exporter(recorder.clone());

    let conn = dialer.dial_context("example.com:443").await;
    assert!(conn.is_ok());

    // Exactly two attempts, one selection counter increment each.
    assert_eq!(s0.dials(), 1);
    assert_eq!(s1.dials(), 1);

    let selected = recorder.selected.lock().unwrap();
    assert_eq!(
        *selected,
        vec![
            ("s0".to_string(), "example.com:443".to_string()),
            ("s1".to_string(), "example.com:443".to_string()),
        ]
    );
}

#[tokio::test]
async fn exhaustion_surfaces_the_last_error() {
    let store = Arc::new(SourceStore::new());
    store.put(&[
        MockSource::inactive("s0") as Arc<dyn Source>,
        MockSource::inactive("s1") as Arc<dyn Source>,
    ]);

    let dialer = Dialer::new(store);
    let err = dialer.dial_context("example.com:443").await.unwrap_err();
    assert!(matches!(err, LinkmuxError::Dial { .. }));
}

#[tokio::test]
async fn empty_registry_aborts_immediately() {
    let dialer = Dialer::new(Arc::new(SourceStore::new()));
    let err = dialer.dial_context("example.com:443").await.unwrap_err();
    assert!(matches!(err, LinkmuxError::EmptyRegistry));
}

#[tokio::test]
async fn policies_eliminating_every_source_still_fail_the_dial() {
    let store = Arc::new(SourceStore::new());
    store.put(&[MockSource::inactive("s0") as Arc<dyn Source>]);
    store
        .append_policy(Arc::new(BlockPolicy::new("test", "s0")))
        .unwrap();

    // The blocked source is the only one: it comes back as the last
    // considered candidate, fails to dial, and the dial error surfaces.
    let dialer = Dialer::new(store);
    let err = dialer.dial_context("example.com:443").await.unwrap_err();
    assert!(matches!(err, LinkmuxError::Dial { .. }));
}
