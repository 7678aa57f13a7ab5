//! Source storage with admission policies.
//!
//! The [`SourceStore`] wraps the balancer with an ordered list of
//! [`Policy`] rules and a binding history. Selection composes the two: a
//! policy-derived blacklist is computed per destination and merged with
//! the caller's request-scoped blacklist before the balancer runs.

pub mod policies;

pub use policies::{
    trim_port, AvoidPolicy, BlockPolicy, HistoryQuery, Policy, PolicyKind, PolicySnapshot,
    ReservedPolicy, StickyPolicy,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::core::{Balancer, Source};
use crate::error::{LinkmuxError, LinkmuxResult};

/// Serializable view of a stored source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSnapshot {
    pub name: String,
}

#[derive(Default)]
struct BindHistory {
    recording: bool,
    bindings: HashMap<String, String>,
}

/// Balancer plus policy list plus binding history.
///
/// The policy mutex serialises policy mutations with `put`/`del` and is
/// held across the policy reads taken as part of `get`. The binding
/// history sits behind its own lock so that a sticky policy may query it
/// while a selection is in flight.
pub struct SourceStore {
    balancer: Balancer,
    policies: Mutex<Vec<Arc<dyn Policy>>>,
    history: Mutex<BindHistory>,
}

impl Default for SourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceStore {
    pub fn new() -> Self {
        Self::with_balancer(Balancer::new())
    }

    pub fn with_balancer(balancer: Balancer) -> Self {
        Self {
            balancer,
            policies: Mutex::new(Vec::new()),
            history: Mutex::new(BindHistory::default()),
        }
    }

    /// Select a source allowed to serve `target`.
    ///
    /// Every source refused by some policy for this destination is
    /// blacklisted, together with the caller's own blacklist, and the
    /// balancer picks among the rest. When recording is enabled the
    /// returned binding is added to the history.
    pub fn get(&self, target: &str, blacklist: &[String]) -> LinkmuxResult<Arc<dyn Source>> {
        let policies = self.policies.lock().unwrap();

        let mut combined = self.policy_blacklist(&policies, target);
        combined.extend(blacklist.iter().cloned());

        let source = self.balancer.get(&combined)?;
        drop(policies);

        self.record_binding(target, source.id());
        Ok(source)
    }

    /// Append a policy; a policy with the same identifier must not exist.
    pub fn append_policy(&self, policy: Arc<dyn Policy>) -> LinkmuxResult<()> {
        let mut policies = self.policies.lock().unwrap();
        if policies.iter().any(|p| p.id() == policy.id()) {
            return Err(LinkmuxError::policy_conflict(policy.id()));
        }
        policies.push(policy);
        Ok(())
    }

    /// Remove the policy with the given identifier.
    pub fn del_policy(&self, id: &str) -> LinkmuxResult<()> {
        let mut policies = self.policies.lock().unwrap();
        let before = policies.len();
        policies.retain(|p| p.id() != id);
        if policies.len() == before {
            return Err(LinkmuxError::policy_not_found(id));
        }
        Ok(())
    }

    /// Identifiers of the sources that some policy refuses for `target`.
    pub fn make_blacklist(&self, target: &str) -> Vec<String> {
        let policies = self.policies.lock().unwrap();
        self.policy_blacklist(&policies, target)
    }

    fn policy_blacklist(&self, policies: &[Arc<dyn Policy>], target: &str) -> Vec<String> {
        if policies.is_empty() {
            return Vec::new();
        }

        let host = trim_port(target);
        let mut blacklist = Vec::new();
        self.balancer.for_each(|source| {
            if policies.iter().any(|p| !p.accept(source.id(), host)) {
                blacklist.push(source.id().to_string());
            }
        });
        blacklist
    }

    /// Whether `source_id` may serve `target`, together with the first
    /// policy that refuses it.
    pub fn should_accept(&self, source_id: &str, target: &str) -> (bool, Option<Arc<dyn Policy>>) {
        let host = trim_port(target);
        let policies = self.policies.lock().unwrap();
        match policies.iter().find(|p| !p.accept(source_id, host)) {
            Some(refuser) => (false, Some(refuser.clone())),
            None => (true, None),
        }
    }

    /// Record each successful selection into the binding history.
    pub fn record_bind_history(&self) {
        self.history.lock().unwrap().recording = true;
    }

    /// Stop recording and reset the accumulated bindings.
    pub fn stop_recording_bind_history(&self) {
        let mut history = self.history.lock().unwrap();
        history.recording = false;
        history.bindings.clear();
    }

    /// The source `target` is currently bound to, if any.
    pub fn query_bind_history(&self, target: &str) -> Option<String> {
        let host = trim_port(target);
        self.history.lock().unwrap().bindings.get(host).cloned()
    }

    fn record_binding(&self, target: &str, source_id: &str) {
        let mut history = self.history.lock().unwrap();
        if history.recording {
            history
                .bindings
                .insert(trim_port(target).to_string(), source_id.to_string());
        }
    }

    /// View of the stored sources for the admin surface.
    pub fn sources_snapshot(&self) -> Vec<SourceSnapshot> {
        let mut snapshot = Vec::with_capacity(self.balancer.len());
        self.balancer.for_each(|source| {
            snapshot.push(SourceSnapshot {
                name: source.id().to_string(),
            });
        });
        snapshot
    }

    /// View of the registered policies for the admin surface.
    pub fn policies_snapshot(&self) -> Vec<PolicySnapshot> {
        self.policies
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.snapshot())
            .collect()
    }

    pub fn put(&self, sources: &[Arc<dyn Source>]) {
        let _policies = self.policies.lock().unwrap();
        self.balancer.put(sources);
    }

    pub fn del(&self, sources: &[Arc<dyn Source>]) {
        let _policies = self.policies.lock().unwrap();
        self.balancer.del(sources);
    }

    pub fn for_each<F: FnMut(&Arc<dyn Source>)>(&self, f: F) {
        self.balancer.for_each(f);
    }

    pub fn len(&self) -> usize {
        self.balancer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancer.is_empty()
    }
}
