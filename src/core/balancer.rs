use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::ring::Ring;
use crate::core::Source;
use crate::error::{LinkmuxError, LinkmuxResult};

/// Chooses a source from a ring of sources, typically advancing the
/// position as a side effect.
pub trait Strategy: Send + Sync {
    fn select(&self, ring: &mut Ring<Arc<dyn Source>>) -> LinkmuxResult<Arc<dyn Source>>;
}

/// Naive strategy that returns each element of the ring in turn.
pub struct RoundRobin;

impl Strategy for RoundRobin {
    fn select(&self, ring: &mut Ring<Arc<dyn Source>>) -> LinkmuxResult<Arc<dyn Source>> {
        let source = ring
            .current()
            .ok_or_else(|| LinkmuxError::internal("balancer ring holds an unset slot"))?;
        ring.next();
        Ok(source)
    }
}

/// Distributes work to a set of sources using a particular strategy.
///
/// A single mutex guards the ring position; every mutating and iterating
/// operation acquires it, and `get` holds it for the duration of a call.
pub struct Balancer {
    ring: Mutex<Option<Ring<Arc<dyn Source>>>>,
    strategy: Box<dyn Strategy>,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer {
    /// Create a balancer with the default round-robin strategy.
    pub fn new() -> Self {
        Self::with_strategy(Box::new(RoundRobin))
    }

    pub fn with_strategy(strategy: Box<dyn Strategy>) -> Self {
        Self {
            ring: Mutex::new(None),
            strategy,
        }
    }

    /// Select a source using the configured strategy, skipping the sources
    /// whose identifiers appear in `blacklist`.
    ///
    /// The strategy is invoked at most `len` times per call and its errors
    /// are not retried. When every source is blacklisted the last source
    /// the strategy produced is returned: the caller's retry loop is
    /// already bounded by the registry size, so a repeated source only
    /// costs one extra failed attempt. Fails with `EmptyRegistry` when no
    /// source is registered.
    pub fn get(&self, blacklist: &[String]) -> LinkmuxResult<Arc<dyn Source>> {
        let mut guard = self.ring.lock().unwrap();
        let ring = guard.as_mut().ok_or(LinkmuxError::EmptyRegistry)?;

        if blacklist.is_empty() {
            return self.strategy.select(ring);
        }

        let skip: HashSet<&str> = blacklist.iter().map(String::as_str).collect();
        let mut selected = None;
        for _ in 0..ring.len() {
            let source = self.strategy.select(ring)?;
            let blacklisted = skip.contains(source.id());
            selected = Some(source);
            if !blacklisted {
                break;
            }
        }

        selected.ok_or(LinkmuxError::EmptyRegistry)
    }

    /// Insert sources into the ring, preserving the current position; the
    /// new sources land at the tail, right behind the current element.
    /// Silently returns when `sources` is empty.
    pub fn put(&self, sources: &[Arc<dyn Source>]) {
        if sources.is_empty() {
            return;
        }

        let fresh = Ring::with_values(sources.iter().cloned());

        let mut guard = self.ring.lock().unwrap();
        match guard.as_mut() {
            None => *guard = Some(fresh),
            Some(ring) => {
                // Step back so the splice lands between the tail and the
                // current element, keeping the position unchanged.
                ring.prev();
                ring.link(fresh);
            }
        }
    }

    /// Remove the sources with matching identifiers, rebuilding the ring
    /// from the survivors.
    pub fn del(&self, sources: &[Arc<dyn Source>]) {
        let doomed: HashSet<&str> = sources.iter().map(|s| s.id()).collect();

        let mut guard = self.ring.lock().unwrap();
        let Some(ring) = guard.as_ref() else {
            return;
        };

        let mut survivors: Vec<Arc<dyn Source>> = Vec::with_capacity(ring.len());
        ring.for_each(|s| {
            if !doomed.contains(s.id()) {
                survivors.push(s.clone());
            }
        });

        *guard = if survivors.is_empty() {
            None
        } else {
            Some(Ring::with_values(survivors))
        };
    }

    /// Apply `f` to every source under the balancer mutex.
    pub fn for_each<F: FnMut(&Arc<dyn Source>)>(&self, f: F) {
        let guard = self.ring.lock().unwrap();
        if let Some(ring) = guard.as_ref() {
            ring.for_each(f);
        }
    }

    /// Size of the set of sources stored in the balancer.
    pub fn len(&self) -> usize {
        self.ring
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |ring| ring.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
