//! Transport seam between the multiplexer and the realtime backend.
//!
//! The runtime never talks to a concrete backend. It opens per-table
//! channels through the [`Transport`] trait and receives everything the
//! backend has to say over a single event channel: row changes, channel
//! closures, and link transitions. [`memory::MemoryTransport`] is the
//! in-process implementation used by the test suites; production backends
//! adapt their client the same way.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::Table;

pub mod memory;

/// Errors surfaced by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not reach the backend at all.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The backend refused the channel.
    #[error("Channel rejected by server: {0}")]
    Rejected(String),

    /// Credentials were missing or stale.
    #[error("Authorization failed: {0}")]
    Unauthorized(String),

    /// The transport knows it is offline.
    #[error("Transport offline")]
    Offline,

    /// The transport was shut down.
    #[error("Transport closed")]
    Closed,
}

/// Everything a backend can report to the multiplexer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A row in `table` changed. The payload is opaque to the runtime.
    Change { table: Table, payload: Bytes },

    /// The backend closed a channel the runtime did not ask to close.
    ChannelClosed { table: Table },

    /// A channel hit an error; the backend considers it unusable.
    ChannelError {
        table: Table,
        error: TransportError,
    },

    /// The underlying link dropped. All channels are implicitly dead.
    LinkDown,

    /// The underlying link came back.
    LinkUp,
}

/// One open per-table channel. Dropping the handle closes the channel.
pub trait TransportChannel: Send + fmt::Debug {
    /// Table this channel feeds.
    fn table(&self) -> &Table;
}

/// A realtime backend able to open per-table change-feed channels.
///
/// `open_channel` resolves once the subscription is acknowledged. Events
/// for the channel, and link-level events, flow through the `events`
/// sender handed in at open time.
pub trait Transport: Send + Sync + 'static {
    fn open_channel(
        &self,
        table: Table,
        events: mpsc::Sender<TransportEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn TransportChannel>, TransportError>> + Send + '_>>;

    /// Socket-level liveness of the link, sampled by the health monitor.
    fn is_connected(&self) -> bool;
}
