//! Reconnect coordination with exponential backoff.
//!
//! One coordinator owns recovery for the whole transport link. A drop takes
//! the link through `stable -> disconnected -> reconnecting` and back: the
//! first sweep runs immediately, every later one waits
//! `min(base * 2^(attempt-1), max)` plus bounded jitter. Individual channel
//! failures while the link is otherwise healthy get per-table retries on the
//! same schedule without disturbing the link state.
//!
//! The coordinator is a pure state machine: it never sleeps or spawns.
//! Callers execute the returned [`ReconnectAction`]s and feed timer
//! expirations back in. Every armed timer carries an epoch; ticks whose
//! epoch no longer matches are discarded, which is how superseded timers
//! are cancelled.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::types::Table;

// ============================================================================
// Backoff policy
// ============================================================================

/// Delay schedule for reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first scheduled retry.
    pub base: Duration,
    /// Ceiling for the doubled delay.
    pub max: Duration,
    /// Jitter fraction applied to each delay, `0.1` means +/-10%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy without jitter. Delays become exact, which tests
    /// rely on.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Deterministic delay before the given attempt.
    ///
    /// Attempt 0 is the immediate attempt and has no delay. Attempt `n >= 1`
    /// waits `min(base * 2^(n-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }

    /// Delay for the attempt with jitter applied.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if delay.is_zero() || self.jitter <= 0.0 {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        delay.mul_f64(factor.max(0.0))
    }
}

// ============================================================================
// Link state
// ============================================================================

/// Link-level state of the reconnect coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport healthy; channels open and close on demand.
    Stable,
    /// Link is down and the next sweep is waiting on its backoff timer.
    Disconnected,
    /// A sweep is in flight: channels torn down, reopens pending.
    Reconnecting,
}

impl LinkState {
    /// Returns the state as a string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Stable => "stable",
            LinkState::Disconnected => "disconnected",
            LinkState::Reconnecting => "reconnecting",
        }
    }
}

/// Why the link was declared down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The transport reported the underlying link dropped.
    TransportDrop,
    /// Too many consecutive liveness samples failed.
    LivenessTimeout,
    /// Credentials rotated; existing channels are invalid.
    TokenRotation,
    /// The transport rejected a channel with an authorization error.
    AuthExpired,
    /// Caller requested a full re-establish.
    Manual,
}

impl DisconnectCause {
    /// Returns the cause as a string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectCause::TransportDrop => "transport_drop",
            DisconnectCause::LivenessTimeout => "liveness_timeout",
            DisconnectCause::TokenRotation => "token_rotation",
            DisconnectCause::AuthExpired => "auth_expired",
            DisconnectCause::Manual => "manual",
        }
    }

    /// Causes that restart an in-progress recovery instead of piggybacking
    /// on it. Rotated credentials invalidate whatever sweep is running.
    fn forces_restart(&self) -> bool {
        matches!(
            self,
            DisconnectCause::TokenRotation | DisconnectCause::AuthExpired | DisconnectCause::Manual
        )
    }
}

/// Next step the runtime must execute after feeding the coordinator.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReconnectAction {
    /// Tear down every channel and reopen all active tables now.
    BeginSweep,
    /// Arm a link retry timer.
    ScheduleRetry {
        attempt: u32,
        delay: Duration,
        epoch: u64,
    },
    /// Arm a retry timer for a single table; the link stays stable.
    ScheduleTableRetry {
        table: Table,
        attempt: u32,
        delay: Duration,
        epoch: u64,
    },
    /// Nothing to do.
    None,
}

#[derive(Debug, Default)]
struct TableRetry {
    attempt: u32,
    epoch: u64,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Centralized reconnect state machine.
///
/// Single-owner: only the coordinator task mutates it, so plain fields
/// suffice. Timer callbacks re-enter through epoch-stamped ticks.
#[derive(Debug)]
pub(crate) struct ReconnectCoordinator {
    policy: BackoffPolicy,
    state: LinkState,
    /// Failed sweep attempts in the current outage.
    attempt: u32,
    /// Epoch of the currently armed link timer, if any.
    epoch: u64,
    /// Tables the in-flight sweep is still waiting on.
    pending: HashSet<Table>,
    /// Every table the in-flight sweep reopened, reported on completion.
    swept: Vec<Table>,
    table_retries: HashMap<Table, TableRetry>,
    next_epoch: u64,
}

impl ReconnectCoordinator {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Stable,
            attempt: 0,
            epoch: 0,
            pending: HashSet::new(),
            swept: Vec::new(),
            table_retries: HashMap::new(),
            next_epoch: 0,
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    /// Failed sweep attempts in the current outage.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True while the coordinator owns recovery of the link.
    pub(crate) fn is_down(&self) -> bool {
        self.state != LinkState::Stable
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.epoch = self.next_epoch;
        self.epoch
    }

    /// Records a disconnect. Returns `BeginSweep` when a sweep should start
    /// right now.
    pub(crate) fn on_disconnect(&mut self, cause: DisconnectCause) -> ReconnectAction {
        match self.state {
            LinkState::Stable => {
                info!(cause = cause.as_str(), "connection lost, starting recovery");
                self.state = LinkState::Disconnected;
                self.attempt = 0;
                self.table_retries.clear();
                self.bump_epoch();
                ReconnectAction::BeginSweep
            }
            LinkState::Disconnected | LinkState::Reconnecting if cause.forces_restart() => {
                info!(
                    cause = cause.as_str(),
                    state = self.state.as_str(),
                    "recovery restarted"
                );
                self.state = LinkState::Disconnected;
                self.pending.clear();
                self.swept.clear();
                self.bump_epoch();
                ReconnectAction::BeginSweep
            }
            _ => {
                debug!(
                    cause = cause.as_str(),
                    state = self.state.as_str(),
                    "disconnect signal ignored, recovery already active"
                );
                ReconnectAction::None
            }
        }
    }

    /// Marks the start of a sweep over the given tables. Returns the swept
    /// tables immediately when there is nothing to reopen, which completes
    /// the sweep on the spot.
    pub(crate) fn begin_sweep(&mut self, tables: Vec<Table>) -> Option<Vec<Table>> {
        self.state = LinkState::Reconnecting;
        self.swept = tables;
        self.pending = self.swept.iter().cloned().collect();
        debug!(
            tables = self.swept.len(),
            attempt = self.attempt,
            "reconnect sweep started"
        );
        if self.pending.is_empty() {
            Some(self.finish_sweep())
        } else {
            None
        }
    }

    fn finish_sweep(&mut self) -> Vec<Table> {
        info!(
            tables = self.swept.len(),
            attempts = self.attempt,
            "connection restored"
        );
        self.state = LinkState::Stable;
        self.attempt = 0;
        self.bump_epoch();
        self.table_retries.clear();
        std::mem::take(&mut self.swept)
    }

    /// Records one table of the sweep coming up, and clears any per-table
    /// retry state. Returns the full set of reopened tables once the sweep
    /// completes.
    pub(crate) fn on_table_opened(&mut self, table: &Table) -> Option<Vec<Table>> {
        self.table_retries.remove(table);
        if self.state == LinkState::Reconnecting
            && self.pending.remove(table)
            && self.pending.is_empty()
        {
            return Some(self.finish_sweep());
        }
        None
    }

    /// Records a failed open during a sweep. The first failure of a sweep
    /// schedules the next attempt; later ones are absorbed.
    pub(crate) fn on_sweep_failure(&mut self) -> ReconnectAction {
        if self.state != LinkState::Reconnecting {
            return ReconnectAction::None;
        }
        self.state = LinkState::Disconnected;
        self.pending.clear();
        self.swept.clear();
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.jittered(self.attempt);
        let epoch = self.bump_epoch();
        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect attempt failed, backing off"
        );
        ReconnectAction::ScheduleRetry {
            attempt: self.attempt,
            delay,
            epoch,
        }
    }

    /// True when a link retry timer with this epoch is still current and a
    /// new sweep should begin.
    pub(crate) fn on_retry_tick(&mut self, epoch: u64) -> bool {
        self.state == LinkState::Disconnected && self.epoch == epoch
    }

    /// Short-circuits a pending backoff wait, used when the transport
    /// reports the link came back early.
    pub(crate) fn retry_now(&mut self) -> ReconnectAction {
        if self.state == LinkState::Disconnected {
            debug!("link restored early, skipping backoff wait");
            self.bump_epoch();
            ReconnectAction::BeginSweep
        } else {
            ReconnectAction::None
        }
    }

    /// Zeroes the attempt counters for a caller-driven re-establish.
    pub(crate) fn reset_attempts(&mut self) {
        self.attempt = 0;
        self.table_retries.clear();
    }

    /// Records a single channel failing while the link is stable.
    pub(crate) fn on_table_failure(&mut self, table: &Table) -> ReconnectAction {
        if self.state != LinkState::Stable {
            return ReconnectAction::None;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let entry = self.table_retries.entry(table.clone()).or_default();
        entry.attempt = entry.attempt.saturating_add(1);
        entry.epoch = epoch;
        let attempt = entry.attempt;
        let delay = self.policy.jittered(attempt);
        debug!(
            table = %table,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "channel retry scheduled"
        );
        ReconnectAction::ScheduleTableRetry {
            table: table.clone(),
            attempt,
            delay,
            epoch,
        }
    }

    /// True when a per-table retry timer with this epoch is still current.
    pub(crate) fn on_table_retry_tick(&mut self, table: &Table, epoch: u64) -> bool {
        if self.state != LinkState::Stable {
            return false;
        }
        self.table_retries
            .get(table)
            .map(|entry| entry.epoch == epoch)
            .unwrap_or(false)
    }
}
