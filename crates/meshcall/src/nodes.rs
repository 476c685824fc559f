//! # Node Health Registry
//!
//! Tracks which methods each cluster node serves and when it last failed, and
//! turns that into routing candidates.
//!
//! ## Philosophy
//!
//! - **Quarantine by Timestamp**: A failure excludes a node for a fixed window. There is
//!   no counter to reset; a node recovers by itself once the window has passed.
//! - **Narrow Mutation**: Health changes only through `mark_failed`/`mark_success`
//!   (atomic stores under a shared read lock). Capability and membership changes only
//!   through `announce`/`retain`/`remove`.
//!
//! ## Invariants
//!
//! - The method index never references a node that is not in the node table.
//! - A quarantined node never appears in `candidates_for`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use crate::transport::Address;

/// Default time a failed node is kept out of routing.
pub const DEFAULT_QUARANTINE: Duration = Duration::from_millis(5000);

/// Timestamps in milliseconds since the registry epoch, offset by one; 0 means never.
#[derive(Debug, Default)]
struct Health {
    last_failure: AtomicU64,
    last_success: AtomicU64,
}

#[derive(Debug)]
struct NodeRecord {
    served: HashSet<String>,
    health: Arc<Health>,
}

/// A point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub address: Address,
    /// Sorted.
    pub served_methods: Vec<String>,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
    pub quarantined: bool,
}

/// Per-node capability and health table, shared by the dispatchers of a process.
pub struct NodeRegistry {
    epoch: Instant,
    quarantine: Duration,
    nodes: DashMap<Address, NodeRecord>,
    methods: DashMap<String, HashSet<Address>>,
    // Serialises announce/retain/remove against each other. Routing never takes it.
    membership: Mutex<()>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUARANTINE)
    }
}

impl NodeRegistry {
    pub fn new(quarantine: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            quarantine,
            nodes: DashMap::new(),
            methods: DashMap::new(),
            membership: Mutex::new(()),
        }
    }

    pub fn quarantine(&self) -> Duration {
        self.quarantine
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.contains_key(address)
    }

    /// Records the set of methods `address` serves, replacing any earlier announcement.
    ///
    /// Health timestamps survive re-announcement.
    pub fn announce<I, S>(&self, address: &Address, methods: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let served: HashSet<String> = methods.into_iter().map(Into::into).collect();
        let _guard = self.membership.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = match self.nodes.entry(address.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().served == served {
                    return;
                }
                std::mem::replace(&mut slot.get_mut().served, served.clone())
            }
            Entry::Vacant(slot) => {
                slot.insert(NodeRecord {
                    served: served.clone(),
                    health: Arc::default(),
                });
                HashSet::new()
            }
        };

        for stale in previous.difference(&served) {
            self.unindex(stale, address);
        }
        for added in served.difference(&previous) {
            self.methods.entry(added.clone()).or_default().insert(address.clone());
        }

        debug!(node = %address, methods = served.len(), "node announced");
    }

    /// Drops every node not in `members`. Returns the departed addresses.
    pub fn retain(&self, members: &HashSet<Address>) -> Vec<Address> {
        let _guard = self.membership.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let departed: Vec<Address> = self
            .nodes
            .iter()
            .filter(|entry| !members.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for address in &departed {
            self.drop_node(address);
        }

        if !departed.is_empty() {
            info!(departed = departed.len(), remaining = self.nodes.len(), "pruned departed nodes");
        }
        departed
    }

    /// Drops a single node, e.g. on an explicit leave.
    pub fn remove(&self, address: &Address) -> bool {
        let _guard = self.membership.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.drop_node(address)
    }

    fn drop_node(&self, address: &Address) -> bool {
        let Some((_, record)) = self.nodes.remove(address) else {
            return false;
        };
        for method in &record.served {
            self.unindex(method, address);
        }
        true
    }

    fn unindex(&self, method: &str, address: &Address) {
        let now_empty = match self.methods.get_mut(method) {
            Some(mut servers) => {
                servers.remove(address);
                servers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.methods.remove_if(method, |_, servers| servers.is_empty());
        }
    }

    /// Healthy nodes serving `method`, in random order. May be empty.
    pub fn candidates_for(&self, method: &str) -> Vec<Address> {
        let servers: Vec<Address> = match self.methods.get(method) {
            Some(servers) => servers.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let now = self.stamp();
        let mut candidates: Vec<Address> = servers
            .into_iter()
            .filter(|address| match self.nodes.get(address) {
                Some(record) => !self.is_quarantined(&record.health, now),
                None => false,
            })
            .collect();

        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    /// Every known node serving `method`, healthy or not.
    pub fn servers_of(&self, method: &str) -> Vec<Address> {
        let mut servers: Vec<Address> = self
            .methods
            .get(method)
            .map(|servers| servers.iter().cloned().collect())
            .unwrap_or_default();
        servers.sort();
        servers
    }

    /// Records a failure, starting the node's quarantine. Returns whether the node is known.
    pub fn mark_failed(&self, address: &Address) -> bool {
        let Some(record) = self.nodes.get(address) else {
            return false;
        };
        record.health.last_failure.store(self.stamp(), Ordering::Release);
        debug!(node = %address, quarantine = ?self.quarantine, "node marked failed");
        true
    }

    /// Records a success. Does not lift an active quarantine.
    pub fn mark_success(&self, address: &Address) -> bool {
        let Some(record) = self.nodes.get(address) else {
            return false;
        };
        record.health.last_success.store(self.stamp(), Ordering::Release);
        true
    }

    pub fn served_methods(&self, address: &Address) -> Option<Vec<String>> {
        self.nodes.get(address).map(|record| {
            let mut methods: Vec<String> = record.served.iter().cloned().collect();
            methods.sort();
            methods
        })
    }

    pub fn health(&self, address: &Address) -> Option<NodeHealth> {
        let record = self.nodes.get(address)?;
        let now = self.stamp();
        let mut served_methods: Vec<String> = record.served.iter().cloned().collect();
        served_methods.sort();

        Some(NodeHealth {
            address: address.clone(),
            served_methods,
            last_failure: self.instant_of(record.health.last_failure.load(Ordering::Acquire)),
            last_success: self.instant_of(record.health.last_success.load(Ordering::Acquire)),
            quarantined: self.is_quarantined(&record.health, now),
        })
    }

    fn is_quarantined(&self, health: &Health, now: u64) -> bool {
        match health.last_failure.load(Ordering::Acquire) {
            0 => false,
            failed => now.saturating_sub(failed) <= self.quarantine.as_millis() as u64,
        }
    }

    fn stamp(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    fn instant_of(&self, stamp: u64) -> Option<Instant> {
        match stamp {
            0 => None,
            ms => Some(self.epoch + Duration::from_millis(ms - 1)),
        }
    }
}
