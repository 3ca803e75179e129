//! Waiter bookkeeping.
//!
//! Every queued handle is filed in four places: its priority bucket, its
//! reason bucket, its entry bucket, and the flat waiter map. `WaiterIndex`
//! is the only type allowed to touch them, so they change together.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::entry::Entry;
use crate::handle::{HandleId, HandleInfo, Priority};

/// Map from a grouping key to the set of handles filed under it.
///
/// Empty groups are never stored: a key is present iff it has handles.
#[derive(Debug)]
pub(crate) struct GroupIndex<K> {
    groups: BTreeMap<K, BTreeSet<HandleId>>,
}

impl<K: Ord> GroupIndex<K> {
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
        }
    }

    /// Returns false if the handle was already filed under `key`.
    pub fn insert(&mut self, key: K, id: HandleId) -> bool {
        self.groups.entry(key).or_default().insert(id)
    }

    /// Returns false if the handle was not filed under `key`.
    pub fn remove(&mut self, key: &K, id: HandleId) -> bool {
        let Some(group) = self.groups.get_mut(key) else {
            return false;
        };
        let removed = group.remove(&id);
        if group.is_empty() {
            self.groups.remove(key);
        }
        removed
    }

    pub fn get(&self, key: &K) -> Option<&BTreeSet<HandleId>> {
        self.groups.get(key)
    }

    /// Group with the largest key.
    pub fn last(&self) -> Option<(&K, &BTreeSet<HandleId>)> {
        self.groups.last_key_value()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &BTreeSet<HandleId>)> {
        self.groups.iter()
    }

    /// Number of handles across all groups.
    #[cfg(test)]
    pub fn handle_count(&self) -> usize {
        self.groups.values().map(BTreeSet::len).sum()
    }
}

/// A queued handle and the channel that tells its `wait` call it was admitted.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub info: Arc<HandleInfo>,
    pub wake: oneshot::Sender<()>,
}

/// Handle counts of each of the four waiter views. All four are equal
/// whenever the index is consistent.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexLens {
    pub by_priority: usize,
    pub by_reason: usize,
    pub by_entry: usize,
    pub waiters: usize,
}

#[derive(Debug)]
pub(crate) struct WaiterIndex {
    by_priority: GroupIndex<Priority>,
    by_reason: GroupIndex<String>,
    by_entry: GroupIndex<Entry>,
    waiters: HashMap<HandleId, Waiter>,
}

impl WaiterIndex {
    pub fn new() -> Self {
        Self {
            by_priority: GroupIndex::new(),
            by_reason: GroupIndex::new(),
            by_entry: GroupIndex::new(),
            waiters: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn insert(&mut self, waiter: Waiter) {
        let info = Arc::clone(&waiter.info);
        if self.waiters.insert(info.id, waiter).is_some() {
            panic!("handle {} registered as a waiter twice", info.id);
        }
        let filed = self.by_priority.insert(info.priority, info.id)
            && self.by_reason.insert(info.reason.clone(), info.id)
            && self.by_entry.insert(info.entry.clone(), info.id);
        assert!(filed, "waiter index out of sync inserting handle {}", info.id);
        tracing::trace!(handle = %info.id, entry = %info.entry, "Waiter registered");
    }

    /// Deregisters a waiter from all four views. `None` if it is not queued.
    pub fn remove(&mut self, id: HandleId) -> Option<Waiter> {
        let waiter = self.waiters.remove(&id)?;
        let info = &waiter.info;
        let unfiled = self.by_priority.remove(&info.priority, id)
            && self.by_reason.remove(&info.reason, id)
            && self.by_entry.remove(&info.entry, id);
        assert!(unfiled, "waiter index out of sync removing handle {id}");
        tracing::trace!(handle = %id, entry = %info.entry, "Waiter deregistered");
        Some(waiter)
    }

    /// Highest priority among queued handles.
    pub fn top_priority(&self) -> Option<Priority> {
        self.by_priority.last().map(|(priority, _)| *priority)
    }

    /// Entry to admit next: the earliest arrival in the highest priority bucket.
    pub fn next_entry(&self) -> Option<&Entry> {
        let (_, bucket) = self.by_priority.last()?;
        let first = bucket.first()?;
        let waiter = self
            .waiters
            .get(first)
            .unwrap_or_else(|| panic!("priority index names unknown waiter {first}"));
        Some(&waiter.info.entry)
    }

    /// Deregisters every waiter queued for `entry`, in arrival order.
    pub fn take_entry(&mut self, entry: &Entry) -> Vec<Waiter> {
        let ids: Vec<HandleId> = self
            .by_entry
            .get(entry)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        assert!(!ids.is_empty(), "wake targeted {entry} with no waiters");
        ids.into_iter()
            .map(|id| {
                self.remove(id)
                    .unwrap_or_else(|| panic!("entry index names unknown waiter {id}"))
            })
            .collect()
    }

    /// Queued handle count per reason.
    pub fn counts_by_reason(&self) -> BTreeMap<String, usize> {
        self.by_reason
            .iter()
            .map(|(reason, ids)| (reason.clone(), ids.len()))
            .collect()
    }

    #[cfg(test)]
    pub fn lens(&self) -> IndexLens {
        IndexLens {
            by_priority: self.by_priority.handle_count(),
            by_reason: self.by_reason.handle_count(),
            by_entry: self.by_entry.handle_count(),
            waiters: self.waiters.len(),
        }
    }
}
