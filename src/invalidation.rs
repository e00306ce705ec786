//! Cache invalidation routing.
//!
//! Change events name a table; the consumer's query cache speaks keys. The
//! router maps one to the other through the registry and pushes each
//! affected key into the [`CacheInvalidator`] sink exactly once per event.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::registry::SubscriptionRegistry;
use crate::types::{CacheKey, Table};

/// Sink for invalidated cache keys, implemented over the consumer's query
/// cache. Must be cheap and non-blocking; it is called from the coordinator
/// task.
pub trait CacheInvalidator: Send + Sync + 'static {
    fn invalidate(&self, key: &CacheKey);
}

/// Sink that drops every invalidation, for setups without a query cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _key: &CacheKey) {}
}

/// Routes table-level signals to key-level invalidations.
pub(crate) struct CacheInvalidationRouter {
    sink: Arc<dyn CacheInvalidator>,
}

impl CacheInvalidationRouter {
    pub(crate) fn new(sink: Arc<dyn CacheInvalidator>) -> Self {
        Self { sink }
    }

    /// Handles one change notification. Every cache key registered against
    /// the table is invalidated once, highest priority first. Tables with
    /// zero registrations invalidate nothing.
    pub(crate) fn on_change(&self, registry: &SubscriptionRegistry, table: &Table) -> usize {
        let keys = registry.cache_keys_for(table);
        if keys.is_empty() {
            trace!(table = %table, "change on table without registrations, no invalidation");
            return 0;
        }
        for key in &keys {
            self.sink.invalidate(key);
        }
        debug!(table = %table, keys = keys.len(), "invalidated after change");
        keys.len()
    }

    /// Handles a reconnect sweep or forced refresh over several tables.
    /// Each distinct key is invalidated once even when registered against
    /// more than one of them.
    pub(crate) fn on_refresh(&self, registry: &SubscriptionRegistry, tables: &[Table]) -> usize {
        let mut seen: HashSet<CacheKey> = HashSet::new();
        let mut count = 0;
        for table in tables {
            for key in registry.cache_keys_for(table) {
                if seen.insert(key.clone()) {
                    self.sink.invalidate(&key);
                    count += 1;
                }
            }
        }
        if count > 0 {
            debug!(tables = tables.len(), keys = count, "invalidated after refresh");
        }
        count
    }
}
