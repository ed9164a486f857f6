//! Per-connection subscription table.

use crate::error::{ObserveError, Result};
use crate::types::{ObserverId, RequestId};
use std::collections::HashMap;

/// Identity of one live subscription on a connection.
///
/// Keyed by observer *and* instance identity, so two instances observed
/// through the same observer keep independent request ids (and no group
/// membership is ever left without a table entry).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub observer: ObserverId,
    /// Instance identity: stable id when present, else primary key.
    pub instance: String,
}

impl SubscriptionKey {
    pub fn new(observer: ObserverId, instance: impl Into<String>) -> Self {
        Self {
            observer,
            instance: instance.into(),
        }
    }
}

/// One live subscription entry.
#[derive(Clone, Debug)]
pub struct SubscriptionEntry {
    /// Correlation token echoed on every reply for this subscription.
    pub request_id: RequestId,
    /// Groups joined when the subscription was made; left on teardown.
    pub groups: Vec<String>,
}

/// Map of live subscriptions, owned exclusively by one connection's task.
///
/// Invariant: an entry exists if and only if the connection holds an active
/// group membership for that observer/instance pair. Destroyed (entries
/// cleared, memberships released by the session) when the connection
/// terminates, however it terminates.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: HashMap<SubscriptionKey, SubscriptionEntry>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription. A repeat subscribe for the same key overwrites
    /// the prior entry; the replaced entry is returned.
    pub fn record(
        &mut self,
        key: SubscriptionKey,
        request_id: RequestId,
        groups: Vec<String>,
    ) -> Option<SubscriptionEntry> {
        self.entries
            .insert(key, SubscriptionEntry { request_id, groups })
    }

    pub fn lookup(&self, key: &SubscriptionKey) -> Option<&SubscriptionEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry. Removing a key with no live entry is an error, not a
    /// silent no-op.
    pub fn remove(&mut self, key: &SubscriptionKey) -> Result<SubscriptionEntry> {
        self.entries
            .remove(key)
            .ok_or_else(|| ObserveError::NotSubscribed {
                observer: key.observer,
                instance: key.instance.clone(),
            })
    }

    /// Take every entry, leaving the table empty. Used by teardown.
    pub fn drain(&mut self) -> Vec<(SubscriptionKey, SubscriptionEntry)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(observer: u64, instance: &str) -> SubscriptionKey {
        SubscriptionKey::new(ObserverId(observer), instance)
    }

    #[test]
    fn test_record_lookup_remove() {
        let mut table = SubscriptionTable::new();
        let k = key(1, "a");

        assert!(table
            .record(k.clone(), "r1".into(), vec!["g-a".into()])
            .is_none());
        assert_eq!(table.lookup(&k).unwrap().request_id, "r1".into());

        let entry = table.remove(&k).unwrap();
        assert_eq!(entry.groups, vec!["g-a".to_string()]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_repeat_record_overwrites_request_id() {
        let mut table = SubscriptionTable::new();
        let k = key(1, "a");

        table.record(k.clone(), "r1".into(), vec!["g-a".into()]);
        let replaced = table.record(k.clone(), "r2".into(), vec!["g-a".into()]);

        assert_eq!(replaced.unwrap().request_id, "r1".into());
        assert_eq!(table.lookup(&k).unwrap().request_id, "r2".into());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_observer_distinct_instances_coexist() {
        let mut table = SubscriptionTable::new();
        table.record(key(1, "a"), "r1".into(), vec!["g-a".into()]);
        table.record(key(1, "b"), "r2".into(), vec!["g-b".into()]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(&key(1, "a")).unwrap().request_id, "r1".into());
        assert_eq!(table.lookup(&key(1, "b")).unwrap().request_id, "r2".into());
    }

    #[test]
    fn test_remove_missing_entry_errors() {
        let mut table = SubscriptionTable::new();
        let err = table.remove(&key(1, "a")).unwrap_err();
        assert!(matches!(err, ObserveError::NotSubscribed { .. }));
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = SubscriptionTable::new();
        table.record(key(1, "a"), "r1".into(), vec![]);
        table.record(key(2, "b"), "r2".into(), vec![]);

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
