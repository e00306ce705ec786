//! LiveMux - subscription multiplexing and connection health monitoring
//! for live table feeds.
//!
//! Many UI surfaces watching the same database table should cost one
//! transport channel, not one each. LiveMux refcounts registrations per
//! table, debounces channel closes so navigation churn reuses live
//! channels, recovers from outages with exponentially backed-off reconnect
//! sweeps, and routes change notifications to cache invalidations.
//!
//! # High-Level API
//!
//! Most hosts only need the builder and the facade:
//!
//! ```ignore
//! use livemux::{MultiplexerBuilder, Priority, Table};
//!
//! let runtime = MultiplexerBuilder::new(transport, cache).spawn();
//! let mux = runtime.handle().clone();
//!
//! let id = mux.subscribe_to_table("jobs-page", Table::new("jobs")?, "jobs:list", Priority::High);
//! let snapshot = mux.snapshot();
//! assert!(snapshot.contains(&Table::new("jobs")?));
//!
//! mux.unsubscribe_from_table(id);
//! runtime.shutdown().await;
//! ```
//!
//! The transport and cache seams are traits ([`transport::Transport`],
//! [`CacheInvalidator`]); [`transport::memory::MemoryTransport`] is an
//! in-process implementation for tests and local development.

pub mod config;
mod daemon;
pub mod error;
pub mod handle;
pub mod health;
pub mod invalidation;
pub mod logging;
mod pool;
pub mod probe;
pub mod reconnect;
mod registry;
pub mod snapshot;
pub mod stats;
pub mod transport;
pub mod types;

pub use config::MultiplexerConfig;
pub use daemon::MuxDaemon;
pub use error::MuxError;
pub use handle::{Multiplexer, MultiplexerBuilder, MuxRuntime};
pub use health::{ConnectionStatus, HealthEvent, HealthSample, HealthSubscription};
pub use invalidation::{CacheInvalidator, NoopInvalidator};
pub use probe::NetworkProbe;
pub use reconnect::BackoffPolicy;
pub use snapshot::{ConnectionSnapshot, SnapshotSubscription};
pub use stats::MuxStatsSnapshot;
pub use types::{CacheKey, ConsumerId, Priority, RegistrationId, Table};

/// Version of the livemux library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
