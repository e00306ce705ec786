//! In-process transport with full failure injection.
//!
//! Drives the multiplexer without a network: tests publish change events,
//! flip the link up and down, and inject open failures, then assert on the
//! open/close counters. The transport also self-checks the multiplexer's
//! core contract: opening a second concurrent channel for the same table is
//! recorded as a violation.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::probe::NetworkProbe;
use crate::transport::{Transport, TransportChannel, TransportError, TransportEvent};
use crate::types::Table;

/// Per-table open/close counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableCounters {
    pub opened: u64,
    pub closed: u64,
}

#[derive(Debug)]
struct OpenChannel {
    id: u64,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Debug)]
struct MemoryInner {
    online: AtomicBool,
    link_up: AtomicBool,
    open_delay_ms: AtomicU64,
    next_channel_id: AtomicU64,
    injected_failures: Mutex<VecDeque<TransportError>>,
    channels: DashMap<Table, OpenChannel>,
    counters: DashMap<Table, TableCounters>,
    opened_total: AtomicU64,
    closed_total: AtomicU64,
    concurrent_open_violations: AtomicU64,
    /// Latest event sender seen at open time, used for link transitions.
    feed: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

/// In-memory [`Transport`] backend.
///
/// Cloning shares the same backend, so a test can keep one handle while the
/// runtime owns another. Also implements [`NetworkProbe`], reporting online
/// whenever [`set_online`](Self::set_online) has it up.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                online: AtomicBool::new(true),
                link_up: AtomicBool::new(true),
                open_delay_ms: AtomicU64::new(0),
                next_channel_id: AtomicU64::new(1),
                injected_failures: Mutex::new(VecDeque::new()),
                channels: DashMap::new(),
                counters: DashMap::new(),
                opened_total: AtomicU64::new(0),
                closed_total: AtomicU64::new(0),
                concurrent_open_violations: AtomicU64::new(0),
                feed: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Test controls
    // ------------------------------------------------------------------

    /// Simulated latency for every `open_channel` call.
    pub fn set_open_delay(&self, delay: Duration) {
        self.inner
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Queues an error; the next open consumes it and fails.
    pub fn inject_open_failure(&self, error: TransportError) {
        self.inner.injected_failures.lock().unwrap().push_back(error);
    }

    /// Queues `n` generic connect failures.
    pub fn fail_next_opens(&self, n: usize) {
        let mut queue = self.inner.injected_failures.lock().unwrap();
        for _ in 0..n {
            queue.push_back(TransportError::ConnectFailed("injected failure".into()));
        }
    }

    /// Flips machine-level reachability. While offline, opens fail with
    /// [`TransportError::Offline`] and the probe reports unreachable.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Drops the link out from under every open channel and emits
    /// [`TransportEvent::LinkDown`].
    pub fn drop_link(&self) {
        self.inner.link_up.store(false, Ordering::SeqCst);
        self.send_link_event(TransportEvent::LinkDown);
    }

    /// Kills the link without any event, the way a silently dead connection
    /// looks. Only liveness sampling of `is_connected` can notice this.
    pub fn stall_link(&self) {
        self.inner.link_up.store(false, Ordering::SeqCst);
    }

    /// Brings the link back and emits [`TransportEvent::LinkUp`].
    pub fn restore_link(&self) {
        self.inner.link_up.store(true, Ordering::SeqCst);
        self.send_link_event(TransportEvent::LinkUp);
    }

    fn send_link_event(&self, event: TransportEvent) {
        let feed = self.inner.feed.lock().unwrap();
        if let Some(sender) = feed.as_ref() {
            let _ = sender.try_send(event);
        }
    }

    /// Delivers a change event on the table's channel. Returns false when no
    /// channel is open or the link is down.
    pub fn publish(&self, table: &Table, payload: impl Into<Bytes>) -> bool {
        if !self.inner.link_up.load(Ordering::SeqCst) {
            return false;
        }
        let Some(channel) = self.inner.channels.get(table) else {
            return false;
        };
        channel
            .events
            .try_send(TransportEvent::Change {
                table: table.clone(),
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Server-side close of one channel: removes it and emits
    /// [`TransportEvent::ChannelClosed`].
    pub fn close_from_server(&self, table: &Table) -> bool {
        let Some((_, channel)) = self.inner.channels.remove(table) else {
            return false;
        };
        self.record_close(table);
        let _ = channel.events.try_send(TransportEvent::ChannelClosed {
            table: table.clone(),
        });
        true
    }

    /// Emits a [`TransportEvent::ChannelError`] on the table's channel.
    pub fn error_from_server(&self, table: &Table, error: TransportError) -> bool {
        let Some(channel) = self.inner.channels.get(table) else {
            return false;
        };
        channel
            .events
            .try_send(TransportEvent::ChannelError {
                table: table.clone(),
                error,
            })
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Observations
    // ------------------------------------------------------------------

    /// Tables with a channel currently open.
    pub fn open_tables(&self) -> Vec<Table> {
        let mut tables: Vec<Table> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        tables.sort();
        tables
    }

    pub fn is_open(&self, table: &Table) -> bool {
        self.inner.channels.contains_key(table)
    }

    /// Lifetime open/close counts for one table.
    pub fn counters(&self, table: &Table) -> TableCounters {
        self.inner
            .counters
            .get(table)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    pub fn total_opened(&self) -> u64 {
        self.inner.opened_total.load(Ordering::SeqCst)
    }

    pub fn total_closed(&self) -> u64 {
        self.inner.closed_total.load(Ordering::SeqCst)
    }

    /// Times a second channel was opened for a table that already had one.
    /// A multiplexer honoring its sharing contract keeps this at zero.
    pub fn concurrent_open_violations(&self) -> u64 {
        self.inner.concurrent_open_violations.load(Ordering::SeqCst)
    }

    fn record_close(&self, table: &Table) {
        self.inner.closed_total.fetch_add(1, Ordering::SeqCst);
        self.inner.counters.entry(table.clone()).or_default().closed += 1;
    }
}

impl Transport for MemoryTransport {
    fn open_channel(
        &self,
        table: Table,
        events: mpsc::Sender<TransportEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn TransportChannel>, TransportError>> + Send + '_>>
    {
        Box::pin(async move {
            let delay_ms = self.inner.open_delay_ms.load(Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            if let Some(error) = self.inner.injected_failures.lock().unwrap().pop_front() {
                debug!(table = %table, %error, "memory transport failing open on request");
                return Err(error);
            }
            if !self.inner.online.load(Ordering::SeqCst) {
                return Err(TransportError::Offline);
            }
            if !self.inner.link_up.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectFailed("link down".into()));
            }

            *self.inner.feed.lock().unwrap() = Some(events.clone());

            let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
            let previous = self.inner.channels.insert(
                table.clone(),
                OpenChannel {
                    id,
                    events,
                },
            );
            if previous.is_some() {
                self.inner
                    .concurrent_open_violations
                    .fetch_add(1, Ordering::SeqCst);
            }
            self.inner.opened_total.fetch_add(1, Ordering::SeqCst);
            self.inner.counters.entry(table.clone()).or_default().opened += 1;
            debug!(table = %table, id, "memory channel opened");

            Ok(Box::new(MemoryChannel {
                table,
                id,
                transport: self.clone(),
            }) as Box<dyn TransportChannel>)
        })
    }

    fn is_connected(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst) && self.inner.link_up.load(Ordering::SeqCst)
    }
}

impl NetworkProbe for MemoryTransport {
    fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MemoryChannel {
    table: Table,
    id: u64,
    transport: MemoryTransport,
}

impl TransportChannel for MemoryChannel {
    fn table(&self) -> &Table {
        &self.table
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        // only unregister our own generation; a reopened channel stays
        let removed = self
            .transport
            .inner
            .channels
            .remove_if(&self.table, |_, open| open.id == self.id);
        if removed.is_some() {
            self.transport.record_close(&self.table);
            debug!(table = %self.table, id = self.id, "memory channel closed");
        }
    }
}
