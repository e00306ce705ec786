//! Immutable connection snapshots and their listener registry.
//!
//! The coordinator task is the only writer. Each publish swaps in a fresh
//! `Arc<ConnectionSnapshot>` with a strictly increasing version, then
//! notifies every registered listener with that same snapshot. Readers on
//! any thread get a consistent point-in-time view for free; nothing they
//! hold is ever mutated.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::SystemTime;

use tracing::trace;

use crate::health::ConnectionStatus;
use crate::types::{CacheKey, Table};

/// Point-in-time view of the multiplexer for UI consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Strictly increasing publish counter. Version 0 is the empty snapshot
    /// from before the runtime published anything.
    pub version: u64,
    /// Aggregate connection status.
    pub status: ConnectionStatus,
    /// Active tables mapped to their registered cache keys, both sorted.
    pub subscriptions: BTreeMap<Table, Vec<CacheKey>>,
    /// Total live registrations across all tables.
    pub registration_count: usize,
    /// When data was last known fresh: the last successful reconnect sweep
    /// or forced refresh.
    pub last_refresh: Option<SystemTime>,
}

impl ConnectionSnapshot {
    /// The pre-publish snapshot: nothing registered, link vacuously healthy.
    pub fn empty() -> Self {
        Self {
            version: 0,
            status: ConnectionStatus::Connected,
            subscriptions: BTreeMap::new(),
            registration_count: 0,
            last_refresh: None,
        }
    }

    /// Active tables in sorted order.
    pub fn tables(&self) -> Vec<Table> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn contains(&self, table: &Table) -> bool {
        self.subscriptions.contains_key(table)
    }

    /// Field equality ignoring the version stamp, used to skip no-op
    /// publishes.
    pub(crate) fn same_content(&self, other: &Self) -> bool {
        self.status == other.status
            && self.subscriptions == other.subscriptions
            && self.registration_count == other.registration_count
            && self.last_refresh == other.last_refresh
    }
}

type Listener = Arc<dyn Fn(&ConnectionSnapshot) + Send + Sync>;

struct SnapshotShared {
    current: RwLock<Arc<ConnectionSnapshot>>,
    listeners: RwLock<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
}

/// Shared handle to the current snapshot. Cheap to clone.
#[derive(Clone)]
pub struct SnapshotStore {
    shared: Arc<SnapshotShared>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SnapshotShared {
                current: RwLock::new(Arc::new(ConnectionSnapshot::empty())),
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current snapshot. Never blocks on the publisher for long; the write
    /// side only holds the lock to swap an Arc.
    pub fn get(&self) -> Arc<ConnectionSnapshot> {
        self.shared.current.read().unwrap().clone()
    }

    /// Registers a listener called on every publish. Dropping the returned
    /// subscription unregisters it.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> SnapshotSubscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .write()
            .unwrap()
            .insert(id, Arc::new(listener));
        SnapshotSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.read().unwrap().len()
    }

    /// Stamps the next version, swaps the snapshot in, and notifies
    /// listeners with it. Only the coordinator task calls this, so versions
    /// observed anywhere are strictly increasing.
    pub(crate) fn publish(&self, mut snapshot: ConnectionSnapshot) -> Arc<ConnectionSnapshot> {
        let published = {
            let mut current = self.shared.current.write().unwrap();
            snapshot.version = current.version + 1;
            let arc = Arc::new(snapshot);
            *current = arc.clone();
            arc
        };
        trace!(
            version = published.version,
            status = published.status.as_str(),
            tables = published.subscriptions.len(),
            "snapshot published"
        );

        // notify outside the lock so listeners can call get()
        let listeners: Vec<Listener> = {
            let guard = self.shared.listeners.read().unwrap();
            guard.values().cloned().collect()
        };
        for listener in listeners {
            listener(&published);
        }
        published
    }
}

/// RAII registration of a snapshot listener.
pub struct SnapshotSubscription {
    id: u64,
    shared: Weak<SnapshotShared>,
}

impl Drop for SnapshotSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.write().unwrap().remove(&self.id);
        }
    }
}
