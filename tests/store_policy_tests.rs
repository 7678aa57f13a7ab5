//! End-to-end selection scenarios: round-robin, blacklists and the
//! policy kinds, all against the public store API.

mod common;

use std::sync::Arc;

use common::MockSource;
use linkmux::core::Source;
use linkmux::error::LinkmuxError;
use linkmux::store::{BlockPolicy, ReservedPolicy, SourceStore, StickyPolicy};

fn store_with(ids: &[&str]) -> Arc<SourceStore> {
    let store = Arc::new(SourceStore::new());
    let sources: Vec<Arc<dyn Source>> = ids
        .iter()
        .map(|id| MockSource::active(id) as Arc<dyn Source>)
        .collect();
    store.put(&sources);
    store
}

#[test]
fn round_robin_selection() {
    let store = store_with(&["s0", "s1", "s2"]);

    for expected in ["s0", "s1", "s2", "s0"] {
        assert_eq!(store.get("x:1", &[]).unwrap().id(), expected);
    }
}

#[test]
fn user_blacklist_skips_sources() {
    let store = store_with(&["s0", "s1"]);

    assert_eq!(store.get("x:1", &[]).unwrap().id(), "s0");
    assert_eq!(store.get("x:1", &["s1".to_string()]).unwrap().id(), "s0");

    // Fully blacklisted: the last considered source comes back rather
    // than an error; the dialer's retry loop bounds the damage.
    let all = ["s0".to_string(), "s1".to_string()];
    assert!(store.get("x:1", &all).is_ok());
}

#[test]
fn empty_store_errors() {
    let store = SourceStore::new();
    assert!(matches!(
        store.get("x:1", &[]),
        Err(LinkmuxError::EmptyRegistry)
    ));
}

#[test]
fn block_policy_pins_selection() {
    let store = store_with(&["s0", "s1"]);
    store
        .append_policy(Arc::new(BlockPolicy::new("test", "s0")))
        .unwrap();

    for _ in 0..4 {
        assert_eq!(store.get("x:1", &[]).unwrap().id(), "s1");
    }

    // Removing the policy resumes rotation over both sources.
    store.del_policy("block_s0").unwrap();
    let mut seen: Vec<String> = (0..2)
        .map(|_| store.get("x:1", &[]).unwrap().id().to_string())
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["s0", "s1"]);
}

#[tokio::test]
async fn reserved_policy_routes_by_destination() {
    let store = store_with(&["en0", "en4"]);
    let policy = ReservedPolicy::new("test", "en0", &["50.19.247.198".to_string()]).await;
    store.append_policy(Arc::new(policy)).unwrap();

    // The reserved destination always lands on en0, everything else on
    // the other source, regardless of rotation state.
    for _ in 0..3 {
        assert_eq!(store.get("50.19.247.198:443", &[]).unwrap().id(), "en0");
        assert_eq!(store.get("host.com:443", &[]).unwrap().id(), "en4");
    }
}

#[test]
fn sticky_policy_follows_bind_history() {
    let store = store_with(&["s0", "s1"]);

    let weak = Arc::downgrade(&store);
    let policy = StickyPolicy::new(
        "test",
        Box::new(move |host| weak.upgrade().and_then(|s| s.query_bind_history(host))),
    );
    store.append_policy(Arc::new(policy)).unwrap();
    store.record_bind_history();

    // First selection for the target pins it.
    let first = store.get("host:443", &[]).unwrap().id().to_string();
    for _ in 0..3 {
        assert_eq!(store.get("host:443", &[]).unwrap().id(), first);
    }

    // Other targets still rotate onto the remaining source.
    let other = store.get("elsewhere:443", &[]).unwrap().id().to_string();
    assert_ne!(other, first);

    // Resetting the history releases the pin.
    store.stop_recording_bind_history();
    assert!(store.query_bind_history("host:443").is_none());
}

#[test]
fn put_del_round_trip_preserves_snapshot() {
    let store = store_with(&["s0", "s1"]);
    let before = store.sources_snapshot();

    let extra: Vec<Arc<dyn Source>> = vec![MockSource::active("s2") as Arc<dyn Source>];
    store.put(&extra);
    store.del(&extra);

    assert_eq!(store.sources_snapshot(), before);
}
