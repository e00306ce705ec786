//! Network reachability probing.

/// Answers "is the network worth trying right now".
///
/// The runtime consults the probe before opening channels so a machine that
/// knows it is offline defers subscriptions instead of burning connect
/// attempts. Implementations must be cheap; the probe is called on every
/// health tick.
pub trait NetworkProbe: Send + Sync + 'static {
    fn is_online(&self) -> bool;
}

/// Probe that always reports online, for environments without reachability
/// signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl NetworkProbe for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}
