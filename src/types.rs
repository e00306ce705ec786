//! Core identifier types shared across the multiplexer.
//!
//! Tables are the unit of channel sharing, cache keys are the unit of
//! invalidation, and registrations tie the two together for one consumer.

use std::fmt;

use thiserror::Error;

/// Longest accepted table name, `schema.table` with 63-byte identifiers.
const MAX_TABLE_LEN: usize = 127;

/// Error returned when a table name fails validation.
///
/// Invalid table names are programmer errors and are the only input the
/// multiplexer rejects eagerly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid table name `{name}`: {reason}")]
pub struct InvalidTable {
    /// The offending name as supplied.
    pub name: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// A named logical data source backed by at most one transport channel.
///
/// Names follow SQL identifier shape: segments of ASCII alphanumerics and
/// underscores, optionally dot-separated (`public.jobs`). Construction
/// validates eagerly so every `Table` in the system is known-good.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table(String);

impl Table {
    /// Validates and wraps a table name.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTable> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidTable {
                name,
                reason: "name is empty",
            });
        }
        if name.len() > MAX_TABLE_LEN {
            return Err(InvalidTable {
                name,
                reason: "name exceeds 127 bytes",
            });
        }
        for segment in name.split('.') {
            if segment.is_empty() {
                return Err(InvalidTable {
                    name,
                    reason: "empty segment around `.`",
                });
            }
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
                _ => {
                    return Err(InvalidTable {
                        name,
                        reason: "segment must start with a letter or underscore",
                    })
                }
            }
            if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(InvalidTable {
                    name,
                    reason: "segment contains characters outside [A-Za-z0-9_]",
                });
            }
        }
        Ok(Self(name))
    }

    /// Returns the validated name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque cache key owned by the consumer's query cache.
///
/// The multiplexer never interprets keys; it only hands them back to the
/// invalidation sink. Equality and ordering are byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity of one subscribing consumer (a view, a widget, a task).
///
/// Registrations are deduplicated per (consumer, table, cache key), so two
/// consumers watching the same table keep independent registrations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConsumerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConsumerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to one live registration, allocated by the facade at subscribe
/// time so the call never waits on the coordinator task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

impl RegistrationId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Relative importance of a registration.
///
/// Priority orders cache invalidation when a change or reconnect fans out
/// to several keys; it never affects channel lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Returns the priority as a string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_and_schema_qualified_names() {
        assert!(Table::new("jobs").is_ok());
        assert!(Table::new("artist_profiles").is_ok());
        assert!(Table::new("public.job_offers").is_ok());
        assert!(Table::new("_migrations").is_ok());
    }

    #[test]
    fn test_rejects_empty_name() {
        let err = Table::new("").unwrap_err();
        assert_eq!(err.reason, "name is empty");
    }

    #[test]
    fn test_rejects_bad_characters() {
        assert!(Table::new("jobs;drop").is_err());
        assert!(Table::new("jobs table").is_err());
        assert!(Table::new("caf\u{e9}").is_err());
    }

    #[test]
    fn test_rejects_numeric_leading_segment() {
        assert!(Table::new("1jobs").is_err());
        assert!(Table::new("public.2fa").is_err());
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!(Table::new(".jobs").is_err());
        assert!(Table::new("jobs.").is_err());
        assert!(Table::new("a..b").is_err());
    }

    #[test]
    fn test_rejects_overlong_name() {
        let long = "x".repeat(MAX_TABLE_LEN + 1);
        assert!(Table::new(long).is_err());
        let fits = "x".repeat(MAX_TABLE_LEN);
        assert!(Table::new(fits).is_ok());
    }

    #[test]
    fn test_priority_orders_high_first() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_display_round_trips() {
        let table = Table::new("public.jobs").unwrap();
        assert_eq!(table.to_string(), "public.jobs");
        assert_eq!(CacheKey::from("jobs:list").to_string(), "jobs:list");
        assert_eq!(RegistrationId::new(7).to_string(), "reg-7");
    }
}
