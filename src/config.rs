//! Multiplexer configuration.
//!
//! Every timing constant the runtime uses lives here so tests can shrink
//! them to milliseconds. Defaults mirror production behavior: a 2s close
//! debounce, a 2s health tick, a 5 minute staleness threshold, and a
//! 1s-to-30s reconnect backoff.

use std::time::Duration;

use crate::reconnect::BackoffPolicy;

/// Tunable behavior of a [`crate::Multiplexer`].
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// How long a channel with zero registrations stays open before it is
    /// actually closed. A re-subscribe inside the window reuses the channel.
    pub close_debounce: Duration,

    /// A table with no observed activity for this long is reported stale.
    pub stale_threshold: Duration,

    /// Period of the connection-health tick.
    pub health_interval: Duration,

    /// Consecutive failed liveness samples before the link is declared down.
    pub liveness_misses: u32,

    /// Delay schedule for reconnect attempts.
    pub backoff: BackoffPolicy,

    /// Capacity of the facade-to-coordinator command channel.
    pub command_capacity: usize,

    /// Capacity of the transport event channel.
    pub event_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            close_debounce: Duration::from_secs(2),
            stale_threshold: Duration::from_secs(300),
            health_interval: Duration::from_secs(2),
            liveness_misses: 3,
            backoff: BackoffPolicy::default(),
            command_capacity: 256,
            event_capacity: 1024,
        }
    }
}

impl MultiplexerConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the close debounce window.
    pub fn with_close_debounce(mut self, debounce: Duration) -> Self {
        self.close_debounce = debounce;
        self
    }

    /// Sets the staleness threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Sets the health tick interval.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Sets how many missed liveness samples trigger a disconnect.
    pub fn with_liveness_misses(mut self, misses: u32) -> Self {
        self.liveness_misses = misses.max(1);
        self
    }

    /// Sets the reconnect backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = MultiplexerConfig::default();
        assert_eq!(config.close_debounce, Duration::from_secs(2));
        assert_eq!(config.stale_threshold, Duration::from_secs(300));
        assert_eq!(config.health_interval, Duration::from_secs(2));
        assert_eq!(config.liveness_misses, 3);
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.max, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_style_setters() {
        let config = MultiplexerConfig::new()
            .with_close_debounce(Duration::from_millis(50))
            .with_health_interval(Duration::from_millis(20))
            .with_liveness_misses(0);
        assert_eq!(config.close_debounce, Duration::from_millis(50));
        assert_eq!(config.health_interval, Duration::from_millis(20));
        // zero misses would disconnect on every tick
        assert_eq!(config.liveness_misses, 1);
    }
}
