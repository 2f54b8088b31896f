//! Retry cache for work waiting on fabric dependencies.
//!
//! Work that cannot complete because part of the fabric is not there yet
//! (a tunnel that has not come up, an external gateway that is not
//! reachable) is parked here together with the dependencies it waits on.
//! When a dependency is announced the work becomes ready to run again.

use overlay_types::SwitchId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;

/// Something parked work is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Any tunnel originating on the switch.
    TunnelFrom(SwitchId),
    /// A tunnel from the switch towards an address outside the fabric.
    ExternalTunnel { switch: SwitchId, remote: IpAddr },
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::TunnelFrom(switch) => write!(f, "tunnel-from:{}", switch),
            Dependency::ExternalTunnel { switch, remote } => {
                write!(f, "external-tunnel:{}->{}", switch, remote)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct RetryEntry<T> {
    data: T,
    waiting_on: HashSet<Dependency>,
}

/// Cache of parked work indexed by key, with a reverse index from each
/// dependency to the keys waiting on it.
///
/// Re-parking an existing key replaces its data and dependencies.
#[derive(Debug)]
pub struct RetryCache<K, T> {
    entries: HashMap<K, RetryEntry<T>>,
    waiters: HashMap<Dependency, HashSet<K>>,
}

impl<K, T> RetryCache<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Parks `data` under `key` until every dependency is satisfied.
    pub fn park(&mut self, key: K, data: T, dependencies: impl IntoIterator<Item = Dependency>) {
        self.remove(&key);

        let waiting_on: HashSet<Dependency> = dependencies.into_iter().collect();
        for dep in &waiting_on {
            self.waiters
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, RetryEntry { data, waiting_on });
    }

    /// Drops parked work, e.g. because the route it belongs to was removed.
    pub fn remove(&mut self, key: &K) -> Option<T> {
        let entry = self.entries.remove(key)?;
        for dep in &entry.waiting_on {
            if let Some(keys) = self.waiters.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.waiters.remove(dep);
                }
            }
        }
        Some(entry.data)
    }

    /// Marks a dependency as satisfied and returns the work that no longer
    /// waits on anything. The returned entries leave the cache.
    pub fn satisfy(&mut self, dependency: &Dependency) -> Vec<(K, T)> {
        let Some(keys) = self.waiters.remove(dependency) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for key in keys {
            let done = match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.waiting_on.remove(dependency);
                    entry.waiting_on.is_empty()
                }
                None => false,
            };
            if done {
                if let Some(entry) = self.entries.remove(&key) {
                    ready.push((key, entry.data));
                }
            }
        }
        ready
    }

    /// Returns the dependencies `key` still waits on.
    pub fn dependencies(&self, key: &K) -> Option<&HashSet<Dependency>> {
        self.entries.get(key).map(|e| &e.waiting_on)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }
}

impl<K, T> Default for RetryCache<K, T>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
