//! Subscription bookkeeping.
//!
//! The registry is plain single-owner state: only the coordinator task
//! touches it. It answers two questions the rest of the runtime keeps
//! asking: "does this table still need a channel" (refcount) and "which
//! cache keys does a change on this table hit" (key union).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::SystemTime;

use crate::types::{CacheKey, ConsumerId, Priority, RegistrationId, Table};

/// One live interest in a table, held on behalf of one consumer.
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub id: RegistrationId,
    pub consumer: ConsumerId,
    pub table: Table,
    pub cache_key: CacheKey,
    pub priority: Priority,
    pub created_at: SystemTime,
}

impl Registration {
    pub(crate) fn new(
        id: RegistrationId,
        consumer: ConsumerId,
        table: Table,
        cache_key: CacheKey,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            consumer,
            table,
            cache_key,
            priority,
            created_at: SystemTime::now(),
        }
    }
}

/// What `register` did with the incoming registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegisterOutcome {
    /// Fresh interest; the table may need a channel now.
    New,
    /// The same (consumer, table, key) was already registered. The stored
    /// registration adopted the caller's new id; the old one is dead.
    Replaced { previous: RegistrationId },
}

/// All live registrations, indexed by id, by table, and by identity triple.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    by_id: HashMap<RegistrationId, Registration>,
    by_table: HashMap<Table, HashSet<RegistrationId>>,
    identity: HashMap<(ConsumerId, Table, CacheKey), RegistrationId>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a registration, deduplicating per (consumer, table, cache key).
    ///
    /// A duplicate does not grow the registry. The kept registration takes
    /// the new id so the caller's handle is always the live one; priority is
    /// refreshed, the original `created_at` is preserved.
    pub(crate) fn register(&mut self, reg: Registration) -> RegisterOutcome {
        let identity = (reg.consumer.clone(), reg.table.clone(), reg.cache_key.clone());
        if let Some(&previous) = self.identity.get(&identity) {
            if let Some(mut kept) = self.by_id.remove(&previous) {
                if let Some(ids) = self.by_table.get_mut(&kept.table) {
                    ids.remove(&previous);
                    ids.insert(reg.id);
                }
                kept.id = reg.id;
                kept.priority = reg.priority;
                self.identity.insert(identity, reg.id);
                self.by_id.insert(reg.id, kept);
                return RegisterOutcome::Replaced { previous };
            }
        }
        self.by_table.entry(reg.table.clone()).or_default().insert(reg.id);
        self.identity.insert(identity, reg.id);
        self.by_id.insert(reg.id, reg);
        RegisterOutcome::New
    }

    /// Removes a registration. Unknown ids return `None`; double unregister
    /// and unregister-after-replace both land here.
    pub(crate) fn unregister(&mut self, id: RegistrationId) -> Option<Registration> {
        let reg = self.by_id.remove(&id)?;
        if let Some(ids) = self.by_table.get_mut(&reg.table) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_table.remove(&reg.table);
            }
        }
        self.identity
            .remove(&(reg.consumer.clone(), reg.table.clone(), reg.cache_key.clone()));
        Some(reg)
    }

    /// Live registrations for the table.
    pub(crate) fn ref_count(&self, table: &Table) -> usize {
        self.by_table.get(table).map(HashSet::len).unwrap_or(0)
    }

    /// Whether anything still wants this table.
    pub(crate) fn is_active(&self, table: &Table) -> bool {
        self.ref_count(table) > 0
    }

    /// Tables with at least one registration, sorted for stable iteration.
    pub(crate) fn active_tables(&self) -> Vec<Table> {
        let mut tables: Vec<Table> = self.by_table.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Deduplicated cache keys registered against the table, ordered by the
    /// highest interested priority, then lexicographically.
    pub(crate) fn cache_keys_for(&self, table: &Table) -> Vec<CacheKey> {
        let Some(ids) = self.by_table.get(table) else {
            return Vec::new();
        };
        let mut best: BTreeMap<CacheKey, Priority> = BTreeMap::new();
        for id in ids {
            if let Some(reg) = self.by_id.get(id) {
                let slot = best.entry(reg.cache_key.clone()).or_insert(reg.priority);
                if reg.priority < *slot {
                    *slot = reg.priority;
                }
            }
        }
        let mut ranked: Vec<(Priority, CacheKey)> =
            best.into_iter().map(|(key, prio)| (prio, key)).collect();
        ranked.sort();
        ranked.into_iter().map(|(_, key)| key).collect()
    }

    /// Table-to-keys view used to assemble snapshots, deterministically
    /// ordered.
    pub(crate) fn keys_by_table(&self) -> BTreeMap<Table, Vec<CacheKey>> {
        self.by_table
            .keys()
            .map(|table| (table.clone(), self.cache_keys_for(table)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(name: &str) -> Table {
        Table::new(name).unwrap()
    }

    fn reg(id: u64, consumer: &str, table_name: &str, key: &str) -> Registration {
        Registration::new(
            RegistrationId::new(id),
            ConsumerId::from(consumer),
            table(table_name),
            CacheKey::from(key),
            Priority::Medium,
        )
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.register(reg(1, "job-board", "jobs", "jobs:list")), RegisterOutcome::New);
        assert_eq!(registry.ref_count(&table("jobs")), 1);
        assert!(registry.is_active(&table("jobs")));

        let removed = registry.unregister(RegistrationId::new(1)).unwrap();
        assert_eq!(removed.cache_key, CacheKey::from("jobs:list"));
        assert_eq!(registry.ref_count(&table("jobs")), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_identity_replaces_instead_of_growing() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(reg(1, "job-board", "jobs", "jobs:list"));
        let outcome = registry.register(reg(2, "job-board", "jobs", "jobs:list"));
        assert_eq!(
            outcome,
            RegisterOutcome::Replaced {
                previous: RegistrationId::new(1)
            }
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ref_count(&table("jobs")), 1);

        // the retired id is a no-op, the fresh id tears down for real
        assert!(registry.unregister(RegistrationId::new(1)).is_none());
        assert!(registry.unregister(RegistrationId::new(2)).is_some());
        assert_eq!(registry.ref_count(&table("jobs")), 0);
    }

    #[test]
    fn distinct_consumers_share_a_table() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(reg(1, "job-board", "jobs", "jobs:list"));
        registry.register(reg(2, "job-detail", "jobs", "jobs:detail:7"));
        assert_eq!(registry.ref_count(&table("jobs")), 2);

        registry.unregister(RegistrationId::new(1));
        assert_eq!(registry.ref_count(&table("jobs")), 1);
        assert!(registry.is_active(&table("jobs")));
    }

    #[test]
    fn unknown_unregister_is_a_no_op() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(reg(1, "job-board", "jobs", "jobs:list"));
        assert!(registry.unregister(RegistrationId::new(99)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cache_keys_deduplicate_across_consumers() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(reg(1, "board-a", "jobs", "jobs:list"));
        registry.register(reg(2, "board-b", "jobs", "jobs:list"));
        registry.register(reg(3, "detail", "jobs", "jobs:detail:7"));

        let keys = registry.cache_keys_for(&table("jobs"));
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&CacheKey::from("jobs:list")));
        assert!(keys.contains(&CacheKey::from("jobs:detail:7")));
    }

    #[test]
    fn cache_keys_order_by_highest_priority_first() {
        let mut registry = SubscriptionRegistry::new();
        let mut low = reg(1, "list", "jobs", "jobs:list");
        low.priority = Priority::Low;
        let mut high = reg(2, "alerts", "jobs", "jobs:alerts");
        high.priority = Priority::High;
        let medium = reg(3, "detail", "jobs", "jobs:detail");
        registry.register(low);
        registry.register(high);
        registry.register(medium);

        let keys = registry.cache_keys_for(&table("jobs"));
        assert_eq!(
            keys,
            vec![
                CacheKey::from("jobs:alerts"),
                CacheKey::from("jobs:detail"),
                CacheKey::from("jobs:list"),
            ]
        );
    }

    #[test]
    fn shared_key_takes_the_strongest_priority() {
        let mut registry = SubscriptionRegistry::new();
        let mut low = reg(1, "a", "jobs", "jobs:list");
        low.priority = Priority::Low;
        let mut high = reg(2, "b", "jobs", "jobs:list");
        high.priority = Priority::High;
        let mut medium = reg(3, "c", "jobs", "jobs:zz");
        medium.priority = Priority::Medium;
        registry.register(low);
        registry.register(high);
        registry.register(medium);

        // jobs:list is High because one of its two subscribers is
        let keys = registry.cache_keys_for(&table("jobs"));
        assert_eq!(keys, vec![CacheKey::from("jobs:list"), CacheKey::from("jobs:zz")]);
    }

    #[test]
    fn active_tables_are_sorted() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(reg(1, "a", "zebras", "z"));
        registry.register(reg(2, "b", "apples", "a"));
        assert_eq!(registry.active_tables(), vec![table("apples"), table("zebras")]);
    }

    #[test]
    fn keys_by_table_matches_per_table_view() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(reg(1, "a", "jobs", "jobs:list"));
        registry.register(reg(2, "b", "venues", "venues:list"));

        let view = registry.keys_by_table();
        assert_eq!(view.len(), 2);
        assert_eq!(view[&table("jobs")], registry.cache_keys_for(&table("jobs")));
        assert_eq!(view[&table("venues")], registry.cache_keys_for(&table("venues")));
    }

    // ------------------------------------------------------------------
    // Property tests
    // ------------------------------------------------------------------

    #[derive(Debug, Clone)]
    enum Op {
        Register { consumer: u8, table: u8, key: u8 },
        Unregister { slot: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u8..3, 0u8..4).prop_map(|(consumer, table, key)| Op::Register {
                consumer,
                table,
                key
            }),
            (0usize..40).prop_map(|slot| Op::Unregister { slot }),
        ]
    }

    proptest! {
        /// Property: under any register/unregister interleaving the indexes
        /// stay consistent and refcounts equal live registrations.
        #[test]
        fn prop_indexes_stay_consistent(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let mut registry = SubscriptionRegistry::new();
            let mut issued: Vec<RegistrationId> = Vec::new();
            let mut next_id = 1u64;

            for op in ops {
                match op {
                    Op::Register { consumer, table: t, key } => {
                        let id = RegistrationId::new(next_id);
                        next_id += 1;
                        registry.register(Registration::new(
                            id,
                            ConsumerId::from(format!("consumer-{consumer}")),
                            table(&format!("table_{t}")),
                            CacheKey::from(format!("key-{key}")),
                            Priority::Medium,
                        ));
                        issued.push(id);
                    }
                    Op::Unregister { slot } => {
                        if !issued.is_empty() {
                            let id = issued[slot % issued.len()];
                            registry.unregister(id);
                        }
                    }
                }

                let total: usize = registry
                    .active_tables()
                    .iter()
                    .map(|t| registry.ref_count(t))
                    .sum();
                prop_assert_eq!(total, registry.len());
                for t in registry.active_tables() {
                    prop_assert!(registry.ref_count(&t) > 0);
                    prop_assert!(!registry.cache_keys_for(&t).is_empty());
                }
            }
        }

        /// Property: registering the same identity any number of times
        /// leaves exactly one registration.
        #[test]
        fn prop_duplicates_never_accumulate(times in 1usize..20) {
            let mut registry = SubscriptionRegistry::new();
            for i in 0..times {
                registry.register(reg(i as u64 + 1, "job-board", "jobs", "jobs:list"));
            }
            prop_assert_eq!(registry.len(), 1);
            prop_assert_eq!(registry.ref_count(&table("jobs")), 1);
        }
    }
}
