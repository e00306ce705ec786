//! Runtime counters for the multiplexer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters, updated by the coordinator task and readable from any
/// thread.
#[derive(Debug, Default)]
pub struct MuxStats {
    events_received: AtomicU64,
    invalidations: AtomicU64,
    channels_opened: AtomicU64,
    channels_closed: AtomicU64,
    debounce_reuses: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    snapshots_published: AtomicU64,
}

/// Point-in-time copy of [`MuxStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxStatsSnapshot {
    pub events_received: u64,
    pub invalidations: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
    /// Closes avoided because a subscriber returned inside the debounce
    /// window.
    pub debounce_reuses: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub snapshots_published: u64,
}

impl MuxStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_channel_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_debounce_reuse(&self) {
        self.debounce_reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_success(&self) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_published(&self) {
        self.snapshots_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a consistent-enough copy for logging and dashboards.
    pub fn snapshot(&self) -> MuxStatsSnapshot {
        MuxStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            debounce_reuses: self.debounce_reuses.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_successes: self.reconnect_successes.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = MuxStats::new();
        stats.record_event();
        stats.record_event();
        stats.record_invalidations(3);
        stats.record_channel_opened();
        stats.record_debounce_reuse();

        let snap = stats.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.invalidations, 3);
        assert_eq!(snap.channels_opened, 1);
        assert_eq!(snap.channels_closed, 0);
        assert_eq!(snap.debounce_reuses, 1);
    }
}
