//! The multiplexer coordinator task.
//!
//! One task owns all mutable state: registry, channel pool, reconnect
//! coordinator, health monitor. Everything reaches it as a message, so
//! subscribe/unsubscribe races, transport events, and timer expirations are
//! serialized by construction and need no further locking.
//!
//! ```text
//!   facade (any thread)          transport backend
//!        |  commands                  |  events
//!        v                            v
//!   +--------------------------------------------+
//!   |                MuxDaemon                   |
//!   |  registry -> pool -> coordinator -> router |
//!   +--------------------------------------------+
//!        |  snapshots + health events + activity
//!        v
//!   consumers (any thread)
//! ```
//!
//! Wakeups that must fire later (debounce closes, backoff retries) are
//! spawned sleeps that send an epoch-stamped command back into the queue;
//! the owning component discards stale epochs. Each wakeup drains whatever
//! else is queued before recomputing and publishing the snapshot once, so
//! bursts of churn collapse into a single publish.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::MultiplexerConfig;
use crate::error::MuxError;
use crate::health::{
    derive_status, ActivityTracker, ConnectionStatus, HealthEvent, HealthListeners, HealthMonitor,
};
use crate::invalidation::{CacheInvalidationRouter, CacheInvalidator};
use crate::pool::{ChannelPool, ChannelState, EnsureOutcome, OpenOutcome, ReleaseOutcome};
use crate::probe::NetworkProbe;
use crate::reconnect::{DisconnectCause, LinkState, ReconnectAction, ReconnectCoordinator};
use crate::registry::{RegisterOutcome, Registration, SubscriptionRegistry};
use crate::snapshot::{ConnectionSnapshot, SnapshotStore};
use crate::stats::MuxStats;
use crate::transport::{Transport, TransportChannel, TransportError, TransportEvent};
use crate::types::{CacheKey, ConsumerId, Priority, RegistrationId, Table};

/// Most queued commands handled per wakeup before publishing, so a flood
/// cannot starve the shutdown check.
const DRAIN_BATCH: usize = 64;

/// Messages processed by the coordinator task.
#[derive(Debug)]
pub(crate) enum Command {
    Register {
        id: RegistrationId,
        consumer: ConsumerId,
        table: Table,
        cache_key: CacheKey,
        priority: Priority,
    },
    Unregister {
        id: RegistrationId,
    },
    ForceRefresh {
        tables: Option<Vec<Table>>,
    },
    Reestablish,
    TokenRotated,
    OpenCompleted {
        table: Table,
        epoch: u64,
        result: Result<Box<dyn TransportChannel>, TransportError>,
    },
    CloseExpired {
        table: Table,
        epoch: u64,
    },
    ReconnectTick {
        epoch: u64,
    },
    TableRetryTick {
        table: Table,
        epoch: u64,
    },
}

/// Shared handles produced alongside the daemon, consumed by the facade.
pub(crate) struct DaemonHandles {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) activity: Arc<ActivityTracker>,
    pub(crate) health: HealthListeners,
    pub(crate) stats: Arc<MuxStats>,
}

/// The coordinator task. Create it through
/// [`MultiplexerBuilder`](crate::MultiplexerBuilder), then drive it with
/// [`run`](Self::run) on its own task.
pub struct MuxDaemon {
    config: MultiplexerConfig,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn NetworkProbe>,
    registry: SubscriptionRegistry,
    pool: ChannelPool,
    coordinator: ReconnectCoordinator,
    monitor: HealthMonitor,
    router: CacheInvalidationRouter,
    snapshots: SnapshotStore,
    activity: Arc<ActivityTracker>,
    health_listeners: HealthListeners,
    stats: Arc<MuxStats>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    events_rx: mpsc::Receiver<TransportEvent>,
    last_refresh: Option<SystemTime>,
    dirty: bool,
}

impl MuxDaemon {
    pub(crate) fn new(
        config: MultiplexerConfig,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn CacheInvalidator>,
        probe: Arc<dyn NetworkProbe>,
    ) -> (Self, DaemonHandles) {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);

        let snapshots = SnapshotStore::new();
        let activity = Arc::new(ActivityTracker::new(config.stale_threshold));
        let health_listeners = HealthListeners::new();
        let stats = Arc::new(MuxStats::new());

        let pool = ChannelPool::new(
            Arc::clone(&transport),
            commands_tx.clone(),
            events_tx,
            config.close_debounce,
        );
        let coordinator = ReconnectCoordinator::new(config.backoff.clone());
        let monitor = HealthMonitor::new(config.liveness_misses);
        let router = CacheInvalidationRouter::new(cache);

        let handles = DaemonHandles {
            commands: commands_tx.clone(),
            snapshots: snapshots.clone(),
            activity: Arc::clone(&activity),
            health: health_listeners.clone(),
            stats: Arc::clone(&stats),
        };

        let daemon = Self {
            config,
            transport,
            probe,
            registry: SubscriptionRegistry::new(),
            pool,
            coordinator,
            monitor,
            router,
            snapshots,
            activity,
            health_listeners,
            stats,
            commands_tx,
            commands_rx,
            events_rx,
            last_refresh: None,
            dirty: false,
        };
        (daemon, handles)
    }

    /// Runs the coordinator until the token is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            close_debounce_ms = self.config.close_debounce.as_millis() as u64,
            health_interval_ms = self.config.health_interval.as_millis() as u64,
            stale_threshold_ms = self.config.stale_threshold.as_millis() as u64,
            "subscription multiplexer started"
        );

        let mut tick = tokio::time::interval(self.config.health_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }

                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command);
                    let mut drained = 1;
                    while drained < DRAIN_BATCH {
                        match self.commands_rx.try_recv() {
                            Ok(command) => {
                                self.handle_command(command);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    self.flush();
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                    let mut drained = 1;
                    while drained < DRAIN_BATCH {
                        match self.events_rx.try_recv() {
                            Ok(event) => {
                                self.handle_event(event);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    self.flush();
                }

                _ = tick.tick() => {
                    self.on_tick();
                    self.flush();
                }
            }
        }

        let closed = self.pool.teardown_all();
        if !closed.is_empty() {
            debug!(count = closed.len(), "channels closed at shutdown");
        }
        let final_stats = self.stats.snapshot();
        info!(
            events = final_stats.events_received,
            invalidations = final_stats.invalidations,
            reconnects = final_stats.reconnect_successes,
            "subscription multiplexer stopped"
        );
    }

    // ========================================================================
    // Command handling
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register {
                id,
                consumer,
                table,
                cache_key,
                priority,
            } => self.on_register(id, consumer, table, cache_key, priority),
            Command::Unregister { id } => self.on_unregister(id),
            Command::ForceRefresh { tables } => self.on_force_refresh(tables),
            Command::Reestablish => self.on_reestablish(),
            Command::TokenRotated => self.on_token_rotated(),
            Command::OpenCompleted {
                table,
                epoch,
                result,
            } => self.on_open_completed(table, epoch, result),
            Command::CloseExpired { table, epoch } => self.on_close_expired(table, epoch),
            Command::ReconnectTick { epoch } => {
                if self.coordinator.on_retry_tick(epoch) {
                    self.begin_sweep();
                }
            }
            Command::TableRetryTick { table, epoch } => self.on_table_retry(table, epoch),
        }
    }

    fn on_register(
        &mut self,
        id: RegistrationId,
        consumer: ConsumerId,
        table: Table,
        cache_key: CacheKey,
        priority: Priority,
    ) {
        let registration = Registration::new(id, consumer, table.clone(), cache_key, priority);
        match self.registry.register(registration) {
            RegisterOutcome::New => {
                debug!(
                    %id,
                    table = %table,
                    refs = self.registry.ref_count(&table),
                    "registration added"
                );
            }
            RegisterOutcome::Replaced { previous } => {
                debug!(%id, table = %table, %previous, "registration refreshed");
            }
        }
        self.ensure_table(&table);
        self.dirty = true;
    }

    fn on_unregister(&mut self, id: RegistrationId) {
        match self.registry.unregister(id) {
            Some(registration) => {
                let table = registration.table;
                debug!(
                    %id,
                    table = %table,
                    refs = self.registry.ref_count(&table),
                    "registration removed"
                );
                if !self.registry.is_active(&table) {
                    self.release_table(&table);
                }
                self.dirty = true;
            }
            None => {
                debug!(reason = %MuxError::RegistrationNotFound(id), "unregister ignored");
            }
        }
    }

    fn on_force_refresh(&mut self, tables: Option<Vec<Table>>) {
        let targets: Vec<Table> = match tables {
            Some(list) => list
                .into_iter()
                .filter(|table| self.registry.is_active(table))
                .collect(),
            None => self.registry.active_tables(),
        };
        if targets.is_empty() {
            debug!("forced refresh with no active targets");
            return;
        }

        let keys = self.router.on_refresh(&self.registry, &targets);
        self.stats.record_invalidations(keys as u64);
        self.last_refresh = Some(SystemTime::now());
        info!(tables = targets.len(), keys, "forced refresh");
        self.dirty = true;

        if self.coordinator.is_down() {
            // the running recovery will bring channels back
            return;
        }
        let online = self.probe.is_online();
        for table in &targets {
            match self.pool.state_of(table) {
                Some(ChannelState::Open) => {
                    self.pool.teardown(table);
                    self.stats.record_channel_closed();
                    self.ensure_with(table, online);
                }
                // an open is already in flight or parked; cycling it would
                // race the completion
                Some(_) => {}
                None => self.ensure_with(table, online),
            }
        }
    }

    fn on_reestablish(&mut self) {
        info!("re-establishing all subscriptions");
        self.coordinator.reset_attempts();
        let action = self.coordinator.on_disconnect(DisconnectCause::Manual);
        self.apply_action(action);
        self.dirty = true;
    }

    fn on_token_rotated(&mut self) {
        info!("auth token rotated, cycling all channels");
        let action = self.coordinator.on_disconnect(DisconnectCause::TokenRotation);
        self.apply_action(action);
        self.dirty = true;
    }

    fn on_open_completed(
        &mut self,
        table: Table,
        epoch: u64,
        result: Result<Box<dyn TransportChannel>, TransportError>,
    ) {
        match self.pool.complete_open(&table, epoch, result) {
            OpenOutcome::Opened => {
                debug!(table = %table, "channel open");
                self.stats.record_channel_opened();
                self.activity.touch(&table);
                if self.last_refresh.is_none() {
                    self.last_refresh = Some(SystemTime::now());
                }
                if let Some(reopened) = self.coordinator.on_table_opened(&table) {
                    self.finish_recovery(reopened);
                }
                if !self.registry.is_active(&table) {
                    // the last subscriber left mid-open; close on the
                    // normal debounce so a comeback can still reuse it
                    self.release_table(&table);
                }
                self.dirty = true;
            }
            OpenOutcome::Failed(error) => {
                let failure = MuxError::TransportOpen {
                    table: table.clone(),
                    source: error,
                };
                warn!(table = %table, error = %failure, "channel open failed");
                self.on_open_failure(&table, failure);
                self.dirty = true;
            }
            OpenOutcome::Stale => {
                trace!(table = %table, epoch, "orphaned open dropped");
            }
        }
    }

    fn on_open_failure(&mut self, table: &Table, failure: MuxError) {
        match self.coordinator.state() {
            LinkState::Stable if failure.requires_reauth() => {
                // bad credentials affect every channel, not just this one
                let action = self.coordinator.on_disconnect(DisconnectCause::AuthExpired);
                self.apply_action(action);
            }
            LinkState::Stable => {
                if self.registry.is_active(table) {
                    let action = self.coordinator.on_table_failure(table);
                    self.apply_action(action);
                } else {
                    self.activity.forget(table);
                }
            }
            LinkState::Reconnecting => {
                let action = self.coordinator.on_sweep_failure();
                self.apply_action(action);
            }
            LinkState::Disconnected => {
                // next sweep retries everything
            }
        }
    }

    fn on_close_expired(&mut self, table: Table, epoch: u64) {
        let still_unused = !self.registry.is_active(&table);
        if self.pool.close_expired(&table, epoch, still_unused) {
            self.stats.record_channel_closed();
            self.activity.forget(&table);
            self.dirty = true;
        }
    }

    fn on_table_retry(&mut self, table: Table, epoch: u64) {
        if !self.coordinator.on_table_retry_tick(&table, epoch) {
            return;
        }
        if !self.registry.is_active(&table) {
            debug!(table = %table, "retry for unsubscribed table dropped");
            return;
        }
        debug!(table = %table, "retrying channel open");
        self.ensure_table(&table);
        self.dirty = true;
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Change { table, payload } => {
                trace!(table = %table, bytes = payload.len(), "change event");
                self.stats.record_event();
                self.activity.touch(&table);
                let keys = self.router.on_change(&self.registry, &table);
                self.stats.record_invalidations(keys as u64);
            }
            TransportEvent::ChannelClosed { table } => {
                let Some(state) = self.pool.teardown(&table) else {
                    // echo of a close we initiated
                    return;
                };
                warn!(table = %table, "channel closed by server");
                if state == ChannelState::Open {
                    self.stats.record_channel_closed();
                }
                if self.registry.is_active(&table) {
                    let action = self.coordinator.on_table_failure(&table);
                    self.apply_action(action);
                } else {
                    self.activity.forget(&table);
                }
                self.dirty = true;
            }
            TransportEvent::ChannelError { table, error } => {
                warn!(table = %table, %error, "channel error");
                let unauthorized = matches!(error, TransportError::Unauthorized(_));
                if unauthorized && self.coordinator.state() == LinkState::Stable {
                    let action = self.coordinator.on_disconnect(DisconnectCause::AuthExpired);
                    self.apply_action(action);
                    self.dirty = true;
                    return;
                }
                if let Some(state) = self.pool.teardown(&table) {
                    if state == ChannelState::Open {
                        self.stats.record_channel_closed();
                    }
                    if self.registry.is_active(&table) {
                        let action = self.coordinator.on_table_failure(&table);
                        self.apply_action(action);
                    } else {
                        self.activity.forget(&table);
                    }
                    self.dirty = true;
                }
            }
            TransportEvent::LinkDown => {
                let action = self.coordinator.on_disconnect(DisconnectCause::TransportDrop);
                self.apply_action(action);
                self.dirty = true;
            }
            TransportEvent::LinkUp => {
                debug!("transport link restored");
                let action = self.coordinator.retry_now();
                self.apply_action(action);
                if !self.coordinator.is_down() && self.probe.is_online() {
                    let promoted = self.pool.retry_deferred();
                    if !promoted.is_empty() {
                        debug!(count = promoted.len(), "retrying deferred channels");
                    }
                }
                self.dirty = true;
            }
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    fn apply_action(&mut self, action: ReconnectAction) {
        match action {
            ReconnectAction::BeginSweep => self.begin_sweep(),
            ReconnectAction::ScheduleRetry {
                attempt,
                delay,
                epoch,
            } => {
                trace!(attempt, delay_ms = delay.as_millis() as u64, "link retry armed");
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = commands.send(Command::ReconnectTick { epoch }).await;
                });
            }
            ReconnectAction::ScheduleTableRetry {
                table,
                attempt,
                delay,
                epoch,
            } => {
                trace!(
                    table = %table,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "table retry armed"
                );
                let commands = self.commands_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = commands.send(Command::TableRetryTick { table, epoch }).await;
                });
            }
            ReconnectAction::None => {}
        }
    }

    /// Runs one reconnect attempt: close every open channel, then reopen
    /// all active tables. In-flight opens are adopted instead of doubled.
    fn begin_sweep(&mut self) {
        self.stats.record_reconnect_attempt();
        let closed = self.pool.close_all_open();
        for _ in &closed {
            self.stats.record_channel_closed();
        }

        let targets = self.registry.active_tables();
        debug!(
            closed = closed.len(),
            targets = targets.len(),
            attempt = self.coordinator.attempt(),
            "reconnect sweep"
        );
        if let Some(reopened) = self.coordinator.begin_sweep(targets.clone()) {
            self.finish_recovery(reopened);
            return;
        }

        if !self.probe.is_online() {
            debug!("network offline, reconnect attempt skipped");
            let action = self.coordinator.on_sweep_failure();
            self.apply_action(action);
            return;
        }
        for table in &targets {
            self.pool.ensure_channel(table, true);
        }
        self.dirty = true;
    }

    /// The sweep came fully up: back to stable, invalidate everything once.
    fn finish_recovery(&mut self, reopened: Vec<Table>) {
        let all_active = self.registry.active_tables();
        let keys = self.router.on_refresh(&self.registry, &all_active);
        self.stats.record_invalidations(keys as u64);
        self.stats.record_reconnect_success();
        self.last_refresh = Some(SystemTime::now());
        self.monitor.reset();
        info!(
            reopened = reopened.len(),
            keys,
            "subscriptions reestablished"
        );

        // tables registered mid-outage have no handle yet
        let online = self.probe.is_online();
        for table in all_active {
            if self.pool.state_of(&table).is_none() {
                self.ensure_with(&table, online);
            }
        }
        self.dirty = true;
    }

    // ========================================================================
    // Health tick
    // ========================================================================

    fn on_tick(&mut self) {
        if self.coordinator.is_down() {
            self.monitor.reset();
        } else if self.pool.has_demand() {
            let connected = self.transport.is_connected();
            if self.monitor.sample(connected) {
                let action = self
                    .coordinator
                    .on_disconnect(DisconnectCause::LivenessTimeout);
                self.apply_action(action);
                self.dirty = true;
            }
        } else {
            self.monitor.reset();
        }

        if !self.coordinator.is_down() && self.probe.is_online() {
            let promoted = self.pool.retry_deferred();
            if !promoted.is_empty() {
                debug!(count = promoted.len(), "retrying deferred channels");
                self.dirty = true;
            }
        }

        self.emit_health();
    }

    fn current_status(&self) -> ConnectionStatus {
        derive_status(self.coordinator.state(), self.pool.any_connecting())
    }

    fn emit_health(&mut self) {
        let event = HealthEvent {
            status: self.current_status(),
            stale_tables: self.activity.stale_tables(),
        };
        if let Some(event) = self.monitor.observe(event) {
            debug!(
                status = event.status.as_str(),
                stale = event.stale_tables.len(),
                "health changed"
            );
            self.health_listeners.notify(&event);
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn ensure_table(&mut self, table: &Table) {
        if self.coordinator.is_down() {
            // the next sweep reopens every active table, including this one
            return;
        }
        let online = self.probe.is_online();
        self.ensure_with(table, online);
    }

    fn ensure_with(&mut self, table: &Table, online: bool) {
        match self.pool.ensure_channel(table, online) {
            EnsureOutcome::SpawnedOpen | EnsureOutcome::Deferred => {}
            EnsureOutcome::AlreadyPresent { reused } => {
                if reused {
                    self.stats.record_debounce_reuse();
                }
            }
        }
    }

    fn release_table(&mut self, table: &Table) {
        match self.pool.release(table) {
            ReleaseOutcome::CloseArmed | ReleaseOutcome::AwaitingOpen => {}
            ReleaseOutcome::DroppedDeferred | ReleaseOutcome::NoChannel => {
                self.activity.forget(table);
            }
        }
    }

    /// Recomputes and publishes the snapshot when something observable
    /// changed. Identical content is not republished.
    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let snapshot = ConnectionSnapshot {
            version: 0, // stamped by the store
            status: self.current_status(),
            subscriptions: self.registry.keys_by_table(),
            registration_count: self.registry.len(),
            last_refresh: self.last_refresh,
        };
        if snapshot.same_content(&self.snapshots.get()) {
            return;
        }
        self.snapshots.publish(snapshot);
        self.stats.record_snapshot_published();
        self.emit_health();
    }
}
