//! Per-table transport channel lifecycle.
//!
//! The pool guarantees the core sharing contract: at most one transport
//! channel per table, no matter how subscribe and unsubscribe interleave.
//! Opens run on spawned tasks and report back through the coordinator's
//! command channel stamped with the handle's epoch; anything arriving with
//! a stale epoch is discarded, which is how superseded opens and close
//! timers are cancelled without cross-task coordination.
//!
//! Closing is debounced: when a table's refcount reaches zero the channel
//! stays open for a grace window, and a re-subscribe inside the window
//! reuses it with zero transport traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::daemon::Command;
use crate::error::MuxError;
use crate::transport::{Transport, TransportChannel, TransportError, TransportEvent};
use crate::types::Table;

/// Lifecycle state of one table's channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    /// Wanted, but the network probe reported offline; no open in flight.
    Deferred,
    /// An open is in flight.
    Connecting,
    /// The transport acknowledged the subscription.
    Open,
}

struct ChannelHandle {
    state: ChannelState,
    /// Stamped into spawned opens; bumped on teardown to orphan them.
    epoch: u64,
    channel: Option<Box<dyn TransportChannel>>,
    /// Epoch of the armed debounce-close timer, if any.
    pending_close: Option<u64>,
}

/// What `ensure_channel` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnsureOutcome {
    /// No handle existed; an open was spawned.
    SpawnedOpen,
    /// A handle already covers the table. `reused` is true when an armed
    /// debounce close was cancelled, meaning the channel was rescued.
    AlreadyPresent { reused: bool },
    /// Offline; the table is parked until connectivity returns.
    Deferred,
}

/// What `release` did when a table's refcount hit zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    /// Debounce timer armed; the channel closes if nobody returns.
    CloseArmed,
    /// Parked handle discarded, nothing was open.
    DroppedDeferred,
    /// An open is still in flight; its completion re-checks demand.
    AwaitingOpen,
    /// No handle for the table.
    NoChannel,
}

/// Result of feeding an open completion back into the pool.
pub(crate) enum OpenOutcome {
    /// Channel stored; the table is live.
    Opened,
    /// The open failed; the handle is gone.
    Failed(TransportError),
    /// The completion belonged to a torn-down handle and was discarded.
    Stale,
}

/// Owns every per-table channel handle. Single-owner state of the
/// coordinator task.
pub(crate) struct ChannelPool {
    transport: Arc<dyn Transport>,
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<TransportEvent>,
    close_debounce: Duration,
    channels: HashMap<Table, ChannelHandle>,
    epoch_counter: u64,
}

impl ChannelPool {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        commands: mpsc::Sender<Command>,
        events: mpsc::Sender<TransportEvent>,
        close_debounce: Duration,
    ) -> Self {
        Self {
            transport,
            commands,
            events,
            close_debounce,
            channels: HashMap::new(),
            epoch_counter: 0,
        }
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch_counter += 1;
        self.epoch_counter
    }

    /// Makes sure the table is covered by a handle, opening a channel when
    /// needed. Idempotent: an existing handle in any state absorbs the call.
    pub(crate) fn ensure_channel(&mut self, table: &Table, online: bool) -> EnsureOutcome {
        let epoch = self.next_epoch();

        if let Some(handle) = self.channels.get_mut(table) {
            let reused = handle.pending_close.take().is_some();
            if reused {
                debug!(table = %table, "pending close cancelled, channel reused");
            }
            let promote = handle.state == ChannelState::Deferred && online;
            if promote {
                handle.state = ChannelState::Connecting;
                handle.epoch = epoch;
            }
            if promote {
                self.spawn_open(table.clone(), epoch);
            }
            return EnsureOutcome::AlreadyPresent { reused };
        }

        if !online {
            debug!(table = %table, reason = %MuxError::NetworkUnavailable, "channel open deferred");
            self.channels.insert(
                table.clone(),
                ChannelHandle {
                    state: ChannelState::Deferred,
                    epoch: 0,
                    channel: None,
                    pending_close: None,
                },
            );
            return EnsureOutcome::Deferred;
        }

        self.channels.insert(
            table.clone(),
            ChannelHandle {
                state: ChannelState::Connecting,
                epoch,
                channel: None,
                pending_close: None,
            },
        );
        self.spawn_open(table.clone(), epoch);
        EnsureOutcome::SpawnedOpen
    }

    fn spawn_open(&self, table: Table, epoch: u64) {
        trace!(table = %table, epoch, "spawning channel open");
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = transport.open_channel(table.clone(), events).await;
            let _ = commands
                .send(Command::OpenCompleted {
                    table,
                    epoch,
                    result,
                })
                .await;
        });
    }

    /// Reacts to the table's refcount reaching zero.
    ///
    /// Open channels get a debounce timer instead of an immediate close; a
    /// handle whose open is still in flight is left for the completion path
    /// to re-check, so a mid-open cancellation still opens once and then
    /// closes cleanly.
    pub(crate) fn release(&mut self, table: &Table) -> ReleaseOutcome {
        let close_epoch = self.next_epoch();
        let Some(handle) = self.channels.get_mut(table) else {
            return ReleaseOutcome::NoChannel;
        };
        match handle.state {
            ChannelState::Deferred => {
                self.channels.remove(table);
                debug!(table = %table, "deferred handle dropped");
                ReleaseOutcome::DroppedDeferred
            }
            ChannelState::Connecting => ReleaseOutcome::AwaitingOpen,
            ChannelState::Open => {
                handle.pending_close = Some(close_epoch);
                debug!(
                    table = %table,
                    debounce_ms = self.close_debounce.as_millis() as u64,
                    "refcount zero, close debounce armed"
                );
                let commands = self.commands.clone();
                let table = table.clone();
                let debounce = self.close_debounce;
                tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    let _ = commands
                        .send(Command::CloseExpired {
                            table,
                            epoch: close_epoch,
                        })
                        .await;
                });
                ReleaseOutcome::CloseArmed
            }
        }
    }

    /// Feeds an open completion back in. Stale epochs drop the channel on
    /// the floor, which closes it.
    pub(crate) fn complete_open(
        &mut self,
        table: &Table,
        epoch: u64,
        result: Result<Box<dyn TransportChannel>, TransportError>,
    ) -> OpenOutcome {
        let valid = self
            .channels
            .get(table)
            .map(|handle| handle.epoch == epoch && handle.state == ChannelState::Connecting)
            .unwrap_or(false);
        if !valid {
            trace!(table = %table, epoch, "stale open completion discarded");
            return OpenOutcome::Stale;
        }
        match result {
            Ok(channel) => {
                if let Some(handle) = self.channels.get_mut(table) {
                    handle.state = ChannelState::Open;
                    handle.channel = Some(channel);
                }
                OpenOutcome::Opened
            }
            Err(error) => {
                self.channels.remove(table);
                OpenOutcome::Failed(error)
            }
        }
    }

    /// Handles a debounce timer firing. Closes only when the timer is still
    /// the armed one and the table is still unused.
    pub(crate) fn close_expired(&mut self, table: &Table, epoch: u64, still_unused: bool) -> bool {
        let Some(handle) = self.channels.get_mut(table) else {
            return false;
        };
        if handle.pending_close != Some(epoch) {
            trace!(table = %table, epoch, "stale close timer discarded");
            return false;
        }
        if !still_unused {
            handle.pending_close = None;
            return false;
        }
        self.channels.remove(table);
        debug!(table = %table, "debounce expired, channel closed");
        true
    }

    /// Drops one table's handle. Returns the state it was in, `None` when
    /// there was nothing.
    pub(crate) fn teardown(&mut self, table: &Table) -> Option<ChannelState> {
        let handle = self.channels.remove(table)?;
        debug!(table = %table, state = ?handle.state, "channel torn down");
        Some(handle.state)
    }

    /// Drops every handle, closing all open channels. In-flight opens are
    /// orphaned and discarded on completion.
    pub(crate) fn teardown_all(&mut self) -> Vec<Table> {
        let mut tables: Vec<Table> = self.channels.keys().cloned().collect();
        tables.sort();
        if !tables.is_empty() {
            debug!(count = tables.len(), "tearing down all channels");
        }
        self.channels.clear();
        tables
    }

    /// Closes every open channel now, keeping handles whose opens are still
    /// in flight so their completions are adopted rather than doubled.
    /// Returns the tables whose channels were closed.
    pub(crate) fn close_all_open(&mut self) -> Vec<Table> {
        let mut closed: Vec<Table> = self
            .channels
            .iter()
            .filter(|(_, handle)| handle.state == ChannelState::Open)
            .map(|(table, _)| table.clone())
            .collect();
        closed.sort();
        for table in &closed {
            self.channels.remove(table);
        }
        if !closed.is_empty() {
            debug!(count = closed.len(), "open channels closed for sweep");
        }
        closed
    }

    /// Promotes deferred handles to real opens once connectivity returned.
    pub(crate) fn retry_deferred(&mut self) -> Vec<Table> {
        let deferred: Vec<Table> = self
            .channels
            .iter()
            .filter(|(_, handle)| handle.state == ChannelState::Deferred)
            .map(|(table, _)| table.clone())
            .collect();
        for table in &deferred {
            let epoch = self.next_epoch();
            if let Some(handle) = self.channels.get_mut(table) {
                handle.state = ChannelState::Connecting;
                handle.epoch = epoch;
            }
            self.spawn_open(table.clone(), epoch);
        }
        deferred
    }

    /// True while any handle is not fully open yet.
    pub(crate) fn any_connecting(&self) -> bool {
        self.channels
            .values()
            .any(|handle| handle.state != ChannelState::Open)
    }

    /// True while the transport is expected to be live: some channel is
    /// open or actively opening.
    pub(crate) fn has_demand(&self) -> bool {
        self.channels.values().any(|handle| {
            matches!(handle.state, ChannelState::Open | ChannelState::Connecting)
        })
    }

    pub(crate) fn state_of(&self, table: &Table) -> Option<ChannelState> {
        self.channels.get(table).map(|handle| handle.state)
    }

    #[allow(dead_code)]
    pub(crate) fn is_open(&self, table: &Table) -> bool {
        self.state_of(table) == Some(ChannelState::Open)
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    fn has_pending_close(&self, table: &Table) -> bool {
        self.channels
            .get(table)
            .map(|handle| handle.pending_close.is_some())
            .unwrap_or(false)
    }
}
