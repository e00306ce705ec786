//! Error types for the multiplexer.

use thiserror::Error;

use crate::transport::TransportError;
use crate::types::{InvalidTable, RegistrationId, Table};

/// Errors that can occur inside the multiplexer.
///
/// Errors never tear the coordinator down. Channel-open failures feed the
/// reconnect coordinator, unknown registrations degrade to logged no-ops,
/// and only invalid table names surface to callers eagerly.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Opening a transport channel for a table failed.
    #[error("Failed to open channel for table `{table}`: {source}")]
    TransportOpen {
        table: Table,
        source: TransportError,
    },

    /// The transport rejected a channel because credentials lapsed.
    #[error("Authorization expired; full reconnect required")]
    AuthExpired,

    /// An operation referenced a registration that no longer exists.
    #[error("Registration {0} not found")]
    RegistrationNotFound(RegistrationId),

    /// The network probe reported offline before a connect was attempted.
    #[error("Network unavailable; subscription deferred")]
    NetworkUnavailable,

    /// A table name failed validation.
    #[error("Invalid table: {0}")]
    InvalidTable(#[from] InvalidTable),
}

impl MuxError {
    /// Whether the reconnect coordinator should treat this as a stale-token
    /// signal and force a full sweep instead of a per-table retry.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            MuxError::AuthExpired
                | MuxError::TransportOpen {
                    source: TransportError::Unauthorized(_),
                    ..
                }
        )
    }
}
