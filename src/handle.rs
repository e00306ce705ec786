//! Cloneable facade over the coordinator task.
//!
//! The [`Multiplexer`] is what consumers hold. Mutating calls are
//! fire-and-forget commands into the coordinator queue; reads go straight
//! to shared state (snapshot store, activity tracker, stats) without
//! touching the coordinator at all.
//!
//! # Example
//!
//! ```ignore
//! use livemux::{MultiplexerBuilder, Priority, Table};
//!
//! let runtime = MultiplexerBuilder::new(transport, cache).spawn();
//! let mux = runtime.handle().clone();
//!
//! let id = mux.subscribe_to_table("jobs-page", Table::new("jobs")?, "jobs:list", Priority::High);
//! // ... later
//! mux.unsubscribe_from_table(id);
//! runtime.shutdown().await;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::MultiplexerConfig;
use crate::daemon::{Command, DaemonHandles, MuxDaemon};
use crate::error::MuxError;
use crate::health::{ActivityTracker, HealthEvent, HealthListeners, HealthSample, HealthSubscription};
use crate::invalidation::CacheInvalidator;
use crate::probe::{AlwaysOnline, NetworkProbe};
use crate::snapshot::{ConnectionSnapshot, SnapshotStore, SnapshotSubscription};
use crate::stats::{MuxStats, MuxStatsSnapshot};
use crate::transport::Transport;
use crate::types::{CacheKey, ConsumerId, Priority, RegistrationId, Table};

/// Shared handle to a running multiplexer.
///
/// Cloneable and thread-safe; all clones talk to the same coordinator.
/// Registration ids are allocated here, so `subscribe_to_table` returns
/// immediately and the caller always holds the id it will later pass to
/// `unsubscribe_from_table`, even before the coordinator has processed
/// the registration.
#[derive(Clone)]
pub struct Multiplexer {
    commands: mpsc::Sender<Command>,
    snapshots: SnapshotStore,
    activity: Arc<ActivityTracker>,
    health: HealthListeners,
    stats: Arc<MuxStats>,
    next_registration: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl Multiplexer {
    fn send(&self, command: Command) {
        if let Err(error) = self.commands.try_send(command) {
            warn!(%error, "multiplexer command dropped");
        }
    }

    /// Registers interest in a table on behalf of a consumer.
    ///
    /// Idempotent per `(consumer, table, cache_key)`: re-subscribing the
    /// same identity replaces the previous registration and the returned
    /// id supersedes the old one.
    pub fn subscribe_to_table(
        &self,
        consumer: impl Into<ConsumerId>,
        table: Table,
        cache_key: impl Into<CacheKey>,
        priority: Priority,
    ) -> RegistrationId {
        let id = RegistrationId::new(self.next_registration.fetch_add(1, Ordering::Relaxed) + 1);
        self.send(Command::Register {
            id,
            consumer: consumer.into(),
            table,
            cache_key: cache_key.into(),
            priority,
        });
        id
    }

    /// Validates the table name and registers in one call.
    ///
    /// The only failure a subscription can surface is an invalid table
    /// name; connectivity problems defer or retry internally and show up
    /// through the status facade instead.
    pub fn subscribe(
        &self,
        consumer: impl Into<ConsumerId>,
        table: &str,
        cache_key: impl Into<CacheKey>,
        priority: Priority,
    ) -> Result<RegistrationId, MuxError> {
        let table = Table::new(table)?;
        Ok(self.subscribe_to_table(consumer, table, cache_key, priority))
    }

    /// Withdraws a registration. Unknown ids are ignored.
    pub fn unsubscribe_from_table(&self, id: RegistrationId) {
        self.send(Command::Unregister { id });
    }

    /// Invalidates every registered cache key and cycles all open channels.
    pub fn force_refresh_subscriptions(&self) {
        self.send(Command::ForceRefresh { tables: None });
    }

    /// Like [`force_refresh_subscriptions`](Self::force_refresh_subscriptions),
    /// limited to the given tables. Tables without registrations are skipped.
    pub fn force_refresh_tables(&self, tables: Vec<Table>) {
        self.send(Command::ForceRefresh {
            tables: Some(tables),
        });
    }

    /// Tears down and reopens every subscription from scratch, resetting
    /// reconnect backoff. For recovery paths where channel state is suspect.
    pub fn reestablish_subscriptions(&self) {
        self.send(Command::Reestablish);
    }

    /// Signals that auth credentials changed; all channels are reopened so
    /// they authenticate with the new token.
    pub fn token_rotated(&self) {
        self.send(Command::TokenRotated);
    }

    /// Returns the current state snapshot. Cheap, lock-free on the read path.
    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.snapshots.get()
    }

    /// Registers a listener invoked on every published snapshot. The
    /// subscription unregisters on drop.
    pub fn on_snapshot_change(
        &self,
        listener: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static,
    ) -> SnapshotSubscription {
        self.snapshots.subscribe(listener)
    }

    /// Registers a listener for connection status and staleness changes.
    pub fn on_health_change(
        &self,
        listener: impl Fn(&HealthEvent) + Send + Sync + 'static,
    ) -> HealthSubscription {
        self.health.subscribe(listener)
    }

    /// True when the table has a channel but no event arrived within the
    /// staleness threshold. Unknown tables are not stale.
    pub fn is_stale(&self, table: &Table) -> bool {
        self.activity.is_stale(table)
    }

    /// Instant of the last received event for the table, if it has one.
    pub fn last_activity(&self, table: &Table) -> Option<Instant> {
        self.activity.last_activity(table)
    }

    /// Activity and staleness for one table in a single read.
    pub fn health_sample(&self, table: &Table) -> HealthSample {
        self.activity.sample(table)
    }

    /// Tables currently considered stale, sorted.
    pub fn stale_tables(&self) -> Vec<Table> {
        self.activity.stale_tables()
    }

    /// Point-in-time counters for diagnostics.
    pub fn stats(&self) -> MuxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Requests coordinator shutdown. All open channels close; queued
    /// commands may be dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled by [`shutdown`](Self::shutdown). Pass a clone to
    /// [`MuxDaemon::run`] when spawning the coordinator manually.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshots.get();
        f.debug_struct("Multiplexer")
            .field("status", &snapshot.status)
            .field("registrations", &snapshot.registration_count)
            .finish()
    }
}

/// Wires a transport and cache sink into a coordinator plus its facade.
pub struct MultiplexerBuilder {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn CacheInvalidator>,
    probe: Arc<dyn NetworkProbe>,
    config: MultiplexerConfig,
}

impl MultiplexerBuilder {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            transport,
            cache,
            probe: Arc::new(AlwaysOnline),
            config: MultiplexerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MultiplexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a connectivity probe; offline subscribe calls defer their
    /// channel opens instead of burning failed attempts.
    pub fn with_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Builds the coordinator and its facade without spawning anything.
    /// The caller runs the daemon, typically
    /// `tokio::spawn(daemon.run(mux.shutdown_token()))`.
    pub fn build(self) -> (MuxDaemon, Multiplexer) {
        let (daemon, handles) = MuxDaemon::new(self.config, self.transport, self.cache, self.probe);
        let DaemonHandles {
            commands,
            snapshots,
            activity,
            health,
            stats,
        } = handles;
        let mux = Multiplexer {
            commands,
            snapshots,
            activity,
            health,
            stats,
            next_registration: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        };
        (daemon, mux)
    }

    /// Builds and spawns the coordinator on the current tokio runtime.
    pub fn spawn(self) -> MuxRuntime {
        let (daemon, mux) = self.build();
        let join = tokio::spawn(daemon.run(mux.shutdown_token()));
        MuxRuntime { handle: mux, join }
    }
}

/// A spawned multiplexer: the facade plus the coordinator's join handle.
pub struct MuxRuntime {
    handle: Multiplexer,
    join: JoinHandle<()>,
}

impl MuxRuntime {
    pub fn handle(&self) -> &Multiplexer {
        &self.handle
    }

    /// Cancels the coordinator and waits for it to finish closing channels.
    pub async fn shutdown(self) {
        self.handle.shutdown();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::invalidation::NoopInvalidator;
    use crate::transport::memory::MemoryTransport;

    fn table(name: &str) -> Table {
        Table::new(name).unwrap()
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !check() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_registration_ids_are_unique_without_waiting() {
        let transport = MemoryTransport::new();
        let (_daemon, mux) =
            MultiplexerBuilder::new(Arc::new(transport), Arc::new(NoopInvalidator)).build();

        let a = mux.subscribe_to_table("page", table("jobs"), "jobs:list", Priority::Medium);
        let b = mux.subscribe_to_table("page", table("jobs"), "jobs:detail", Priority::Medium);
        let c = mux.subscribe_to_table("other", table("venues"), "venues:list", Priority::Low);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.to_string(), "reg-1");
        assert_eq!(c.to_string(), "reg-3");
    }

    #[tokio::test]
    async fn test_subscribe_rejects_only_bad_table_names() {
        let transport = MemoryTransport::new();
        transport.set_online(false);
        let (_daemon, mux) =
            MultiplexerBuilder::new(Arc::new(transport), Arc::new(NoopInvalidator)).build();

        let err = mux
            .subscribe("page", "jobs;drop", "jobs:list", Priority::Medium)
            .unwrap_err();
        assert!(matches!(err, MuxError::InvalidTable(_)));

        // offline is not a subscribe error, it just defers the open
        let id = mux
            .subscribe("page", "jobs", "jobs:list", Priority::Medium)
            .unwrap();
        assert_eq!(id.to_string(), "reg-1");
    }

    #[tokio::test]
    async fn test_spawned_runtime_reflects_subscriptions() {
        let transport = MemoryTransport::new();
        let runtime = MultiplexerBuilder::new(
            Arc::new(transport.clone()),
            Arc::new(NoopInvalidator),
        )
        .spawn();
        let mux = runtime.handle().clone();

        let jobs = table("jobs");
        let id = mux.subscribe_to_table("jobs-page", jobs.clone(), "jobs:list", Priority::High);
        wait_until("snapshot to cover the table", || {
            mux.snapshot().contains(&jobs)
        })
        .await;
        assert!(transport.is_open(&jobs));
        assert_eq!(mux.snapshot().registration_count, 1);

        mux.unsubscribe_from_table(id);
        wait_until("registration to drain", || {
            mux.snapshot().registration_count == 0
        })
        .await;

        runtime.shutdown().await;
        assert!(!transport.is_open(&jobs));
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_channels() {
        let transport = MemoryTransport::new();
        let runtime = MultiplexerBuilder::new(
            Arc::new(transport.clone()),
            Arc::new(NoopInvalidator),
        )
        .spawn();
        let mux = runtime.handle().clone();

        let _id = mux.subscribe_to_table("page", table("jobs"), "jobs:list", Priority::Medium);
        wait_until("channel to open", || transport.total_opened() == 1).await;

        runtime.shutdown().await;
        assert_eq!(transport.total_closed(), 1);
    }
}
