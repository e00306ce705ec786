//! Connection health: status derivation, activity tracking, staleness.
//!
//! Health has two faces. The pull side is [`ActivityTracker`], a shared map
//! from table to last-observed activity that any thread can query for
//! staleness. The push side is [`HealthListeners`]: the coordinator task
//! diffs a [`HealthEvent`] every tick and notifies listeners only when the
//! status or the stale set actually changed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::reconnect::LinkState;
use crate::types::Table;

/// Aggregate connection status shown to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Link stable and every wanted channel is open.
    Connected,
    /// Link stable but at least one channel is still coming up.
    Connecting,
    /// The reconnect coordinator owns the link.
    Disconnected,
}

impl ConnectionStatus {
    /// Returns the status as a string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives the externally visible status.
///
/// The coordinator dominates: while it owns the link the status is
/// `disconnected` even though a sweep has channels mid-open, so an outage
/// reads as one `connected -> disconnected -> connected` transition with no
/// flicker. `connecting` only shows for cold opens on a stable link.
pub(crate) fn derive_status(link: LinkState, any_connecting: bool) -> ConnectionStatus {
    match link {
        LinkState::Disconnected | LinkState::Reconnecting => ConnectionStatus::Disconnected,
        LinkState::Stable if any_connecting => ConnectionStatus::Connecting,
        LinkState::Stable => ConnectionStatus::Connected,
    }
}

// ============================================================================
// Activity tracking
// ============================================================================

/// Last-activity timestamps per table, shared between the coordinator task
/// (single writer) and facade readers.
#[derive(Debug)]
pub struct ActivityTracker {
    entries: DashMap<Table, Instant>,
    stale_threshold: Duration,
}

impl ActivityTracker {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            stale_threshold,
        }
    }

    /// Records activity now: a change event or a successful channel open.
    pub(crate) fn touch(&self, table: &Table) {
        self.entries.insert(table.clone(), Instant::now());
    }

    /// Drops the table's entry once nothing subscribes to it anymore.
    pub(crate) fn forget(&self, table: &Table) {
        self.entries.remove(table);
    }

    /// True when the table saw no activity for the staleness threshold.
    /// Tables that were never active are not stale; there is nothing cached
    /// to distrust.
    pub fn is_stale(&self, table: &Table) -> bool {
        self.entries
            .get(table)
            .map(|at| at.elapsed() >= self.stale_threshold)
            .unwrap_or(false)
    }

    pub fn last_activity(&self, table: &Table) -> Option<Instant> {
        self.entries.get(table).map(|at| *at)
    }

    /// Currently stale tables, sorted.
    pub fn stale_tables(&self) -> Vec<Table> {
        let mut stale: Vec<Table> = self
            .entries
            .iter()
            .filter(|entry| entry.value().elapsed() >= self.stale_threshold)
            .map(|entry| entry.key().clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Point-in-time view of one table, recomputed on demand.
    pub fn sample(&self, table: &Table) -> HealthSample {
        let last_activity = self.last_activity(table);
        HealthSample {
            table: table.clone(),
            is_stale: last_activity
                .map(|at| at.elapsed() >= self.stale_threshold)
                .unwrap_or(false),
            last_activity,
        }
    }
}

/// One table's activity as seen at the moment of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSample {
    pub table: Table,
    /// Last change event or successful open. `None` until the first
    /// activity lands.
    pub last_activity: Option<Instant>,
    pub is_stale: bool,
}

// ============================================================================
// Push-side health events
// ============================================================================

/// Payload delivered to health listeners when something changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub status: ConnectionStatus,
    /// Tables currently past the staleness threshold, sorted.
    pub stale_tables: Vec<Table>,
}

type HealthListener = Arc<dyn Fn(&HealthEvent) + Send + Sync>;

struct HealthShared {
    listeners: RwLock<HashMap<u64, HealthListener>>,
    next_id: AtomicU64,
}

/// Registry of health-change listeners. Cheap to clone.
#[derive(Clone)]
pub(crate) struct HealthListeners {
    shared: Arc<HealthShared>,
}

impl HealthListeners {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(HealthShared {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn subscribe(
        &self,
        listener: impl Fn(&HealthEvent) + Send + Sync + 'static,
    ) -> HealthSubscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .write()
            .unwrap()
            .insert(id, Arc::new(listener));
        HealthSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub(crate) fn notify(&self, event: &HealthEvent) {
        let listeners: Vec<HealthListener> = {
            let guard = self.shared.listeners.read().unwrap();
            guard.values().cloned().collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.shared.listeners.read().unwrap().len()
    }
}

/// RAII registration of a health listener.
pub struct HealthSubscription {
    id: u64,
    shared: Weak<HealthShared>,
}

impl Drop for HealthSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.write().unwrap().remove(&self.id);
        }
    }
}

// ============================================================================
// Liveness sampling
// ============================================================================

/// Tick-side bookkeeping: consecutive liveness misses and the last health
/// event handed to listeners.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    misses: u32,
    max_misses: u32,
    last_event: Option<HealthEvent>,
}

impl HealthMonitor {
    pub(crate) fn new(max_misses: u32) -> Self {
        Self {
            misses: 0,
            max_misses: max_misses.max(1),
            last_event: None,
        }
    }

    /// Feeds one liveness sample taken while the link is nominally stable.
    /// Returns true exactly once, on the sample that crosses the miss
    /// threshold.
    pub(crate) fn sample(&mut self, connected: bool) -> bool {
        if connected {
            self.misses = 0;
            return false;
        }
        self.misses = self.misses.saturating_add(1);
        if self.misses == self.max_misses {
            warn!(
                misses = self.misses,
                "transport liveness lost, declaring link down"
            );
            true
        } else {
            false
        }
    }

    pub(crate) fn reset(&mut self) {
        self.misses = 0;
    }

    #[allow(dead_code)]
    pub(crate) fn misses(&self) -> u32 {
        self.misses
    }

    /// Deduplicates health events: Some only when the event differs from the
    /// last one observed.
    pub(crate) fn observe(&mut self, event: HealthEvent) -> Option<HealthEvent> {
        if self.last_event.as_ref() == Some(&event) {
            return None;
        }
        self.last_event = Some(event.clone());
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn table(name: &str) -> Table {
        Table::new(name).unwrap()
    }

    #[test]
    fn test_derive_status_prefers_the_coordinator() {
        assert_eq!(
            derive_status(LinkState::Stable, false),
            ConnectionStatus::Connected
        );
        assert_eq!(
            derive_status(LinkState::Stable, true),
            ConnectionStatus::Connecting
        );
        // mid-sweep opens must not read as "connecting"
        assert_eq!(
            derive_status(LinkState::Reconnecting, true),
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            derive_status(LinkState::Disconnected, false),
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_activity_goes_stale_after_the_threshold() {
        let tracker = ActivityTracker::new(Duration::from_millis(20));
        let jobs = table("jobs");
        tracker.touch(&jobs);
        assert!(!tracker.is_stale(&jobs));

        std::thread::sleep(Duration::from_millis(30));
        assert!(tracker.is_stale(&jobs));
        assert_eq!(tracker.stale_tables(), vec![jobs.clone()]);

        tracker.touch(&jobs);
        assert!(!tracker.is_stale(&jobs));
        assert!(tracker.stale_tables().is_empty());
    }

    #[test]
    fn test_untracked_tables_are_never_stale() {
        let tracker = ActivityTracker::new(Duration::from_millis(1));
        assert!(!tracker.is_stale(&table("jobs")));
        assert!(tracker.last_activity(&table("jobs")).is_none());
    }

    #[test]
    fn test_samples_report_per_table_state() {
        let tracker = ActivityTracker::new(Duration::from_millis(20));
        let jobs = table("jobs");

        let fresh = tracker.sample(&jobs);
        assert_eq!(fresh.table, jobs);
        assert!(fresh.last_activity.is_none());
        assert!(!fresh.is_stale);

        tracker.touch(&jobs);
        std::thread::sleep(Duration::from_millis(30));
        let gone_quiet = tracker.sample(&jobs);
        assert!(gone_quiet.last_activity.is_some());
        assert!(gone_quiet.is_stale);
    }

    #[test]
    fn test_forget_drops_the_entry() {
        let tracker = ActivityTracker::new(Duration::from_millis(1));
        let jobs = table("jobs");
        tracker.touch(&jobs);
        assert_eq!(tracker.tracked(), 1);
        tracker.forget(&jobs);
        assert_eq!(tracker.tracked(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!tracker.is_stale(&jobs));
    }

    #[test]
    fn test_monitor_declares_down_exactly_once() {
        let mut monitor = HealthMonitor::new(3);
        assert!(!monitor.sample(false));
        assert!(!monitor.sample(false));
        assert!(monitor.sample(false));
        // already declared; keep counting without re-firing
        assert!(!monitor.sample(false));
        assert_eq!(monitor.misses(), 4);
    }

    #[test]
    fn test_successful_sample_resets_misses() {
        let mut monitor = HealthMonitor::new(3);
        monitor.sample(false);
        monitor.sample(false);
        assert!(!monitor.sample(true));
        assert_eq!(monitor.misses(), 0);
        // threshold starts over
        assert!(!monitor.sample(false));
        assert!(!monitor.sample(false));
        assert!(monitor.sample(false));
    }

    #[test]
    fn test_observe_suppresses_duplicate_events() {
        let mut monitor = HealthMonitor::new(3);
        let event = HealthEvent {
            status: ConnectionStatus::Connected,
            stale_tables: Vec::new(),
        };
        assert!(monitor.observe(event.clone()).is_some());
        assert!(monitor.observe(event.clone()).is_none());

        let stale = HealthEvent {
            status: ConnectionStatus::Connected,
            stale_tables: vec![table("jobs")],
        };
        assert!(monitor.observe(stale.clone()).is_some());
        assert!(monitor.observe(stale).is_none());
    }

    #[test]
    fn test_listeners_fire_until_dropped() {
        let listeners = HealthListeners::new();
        let seen: Arc<Mutex<Vec<ConnectionStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = listeners.subscribe(move |event| sink.lock().unwrap().push(event.status));
        assert_eq!(listeners.len(), 1);

        listeners.notify(&HealthEvent {
            status: ConnectionStatus::Disconnected,
            stale_tables: Vec::new(),
        });
        drop(sub);
        assert_eq!(listeners.len(), 0);
        listeners.notify(&HealthEvent {
            status: ConnectionStatus::Connected,
            stale_tables: Vec::new(),
        });

        assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Disconnected]);
    }
}
