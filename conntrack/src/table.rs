//! Admission table: bounds the number of distinct active entries.
//!
//! All state (active entries, capacity, waiter indices) lives behind one
//! mutex, so every check-and-register step is a single critical section.
//! Queued callers park on a per-handle oneshot. The wake path makes the
//! admission decision and moves the handles while holding the lock, then
//! fires the oneshots; a woken caller never has to re-check anything.
//!
//! Wake/fairness:
//! - capacity freed (an entry's last handle removed) → wake one entry
//! - `set_max_entries` raised by k → wake up to k entries
//! - `set_no_max_entries` → wake everything
//!
//! "Wake one entry" picks the highest priority bucket, the earliest arrival
//! within it, and admits every handle queued for that entry together.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{TableConfig, TimeoutPolicy};
use crate::entry::Entry;
use crate::handle::{self, EntryHandle, HandleId, HandleInfo, Priority};
use crate::index::{Waiter, WaiterIndex};
use crate::status::{HandleStatus, TableStatus};

#[derive(Debug)]
struct ActiveHandle {
    info: Arc<HandleInfo>,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct TableState {
    /// `None` means unlimited.
    max_entries: Option<usize>,
    /// Entries holding capacity. A key is present iff its set is non-empty.
    active: HashMap<Entry, BTreeMap<HandleId, ActiveHandle>>,
    waiters: WaiterIndex,
}

impl TableState {
    fn has_room(&self) -> bool {
        self.max_entries.is_none_or(|max| self.active.len() < max)
    }

    /// Join an active entry, or take a free slot if no queued handle outranks
    /// this one. Never queues.
    fn try_admit(&mut self, info: &Arc<HandleInfo>) -> bool {
        if let Some(set) = self.active.get_mut(&info.entry) {
            set.insert(info.id, ActiveHandle::new(Arc::clone(info)));
            tracing::debug!(
                handle = %info.id,
                entry = %info.entry,
                joined = set.len(),
                "Joined active entry"
            );
            return true;
        }

        let outranked = self
            .waiters
            .top_priority()
            .is_some_and(|top| info.priority < top);
        if !self.has_room() || outranked {
            return false;
        }

        self.active.insert(
            info.entry.clone(),
            BTreeMap::from([(info.id, ActiveHandle::new(Arc::clone(info)))]),
        );
        tracing::debug!(
            handle = %info.id,
            entry = %info.entry,
            reason = %info.reason,
            priority = %info.priority,
            num_entries = self.active.len(),
            "Entry admitted"
        );
        true
    }

    /// Admit every handle queued for the best waiting entry.
    /// Returns false if nothing is queued.
    fn wake_one(&mut self) -> bool {
        let Some(entry) = self.waiters.next_entry().cloned() else {
            return false;
        };
        assert!(
            !self.active.contains_key(&entry),
            "entry {entry} is both active and queued"
        );

        let woken = self.waiters.take_entry(&entry);
        let count = woken.len();
        let mut set = BTreeMap::new();
        for Waiter { info, wake } in woken {
            set.insert(info.id, ActiveHandle::new(info));
            // A closed receiver means the wait future is being dropped; its
            // guard finds the handle active and releases it.
            let _ = wake.send(());
        }
        self.active.insert(entry.clone(), set);

        tracing::debug!(
            entry = %entry,
            handles = count,
            num_entries = self.active.len(),
            remaining_waiters = self.waiters.len(),
            "Woke queued entry"
        );
        true
    }

    /// Wake entries while there is room, at most `limit` of them.
    fn wake(&mut self, limit: usize) -> usize {
        let mut woken = 0;
        while woken < limit && self.has_room() && self.wake_one() {
            woken += 1;
        }
        woken
    }

    /// Remove an active handle. Frees the entry, and wakes one queued entry
    /// into the freed slot, when it was the entry's last handle.
    fn remove(&mut self, info: &HandleInfo) {
        let Some(set) = self.active.get_mut(&info.entry) else {
            tracing::trace!(handle = %info.id, entry = %info.entry, "Handle already removed");
            return;
        };
        if set.remove(&info.id).is_none() {
            tracing::trace!(handle = %info.id, entry = %info.entry, "Handle already removed");
            return;
        }
        if !set.is_empty() {
            tracing::trace!(
                handle = %info.id,
                entry = %info.entry,
                remaining = set.len(),
                "Handle removed"
            );
            return;
        }

        self.active.remove(&info.entry);
        tracing::debug!(
            handle = %info.id,
            entry = %info.entry,
            num_entries = self.active.len(),
            "Entry released"
        );
        if self.has_room() {
            self.wake_one();
        }
    }
}

impl ActiveHandle {
    fn new(info: Arc<HandleInfo>) -> Self {
        Self {
            info,
            expires_at: None,
        }
    }
}

/// Bounded table of active flow entries with prioritized waiting.
///
/// Shared via `Arc`; handles keep a weak reference back to it.
#[derive(Debug)]
pub struct AdmissionTable {
    state: Mutex<TableState>,
    timeout: TimeoutPolicy,
}

impl AdmissionTable {
    pub fn new(config: TableConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TableState {
                max_entries: config.max_entries,
                active: HashMap::new(),
                waiters: WaiterIndex::new(),
            }),
            timeout: config.timeout,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        match self.state.lock() {
            Ok(guard) => guard,
            // A panic while holding the lock means an invariant check failed
            // mid-mutation; the indices can't be trusted any more.
            Err(_) => panic!("admission table state poisoned by an earlier panic"),
        }
    }

    /// Set a finite capacity. Raising it by k wakes up to k queued entries,
    /// highest priority first. Lowering it never evicts active entries.
    pub fn set_max_entries(&self, max: usize) {
        let mut state = self.lock();
        let previous = state.max_entries.replace(max);
        let woken = match previous {
            Some(previous) if max > previous => state.wake(max - previous),
            _ => 0,
        };
        tracing::info!(
            max_entries = max,
            ?previous,
            woken,
            num_entries = state.active.len(),
            "Set max entries"
        );
    }

    /// Remove the capacity limit and admit every queued entry.
    pub fn set_no_max_entries(&self) {
        let mut state = self.lock();
        state.max_entries = None;
        let woken = state.wake(usize::MAX);
        tracing::info!(woken, "Removed max entries limit");
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.lock().max_entries
    }

    /// Number of distinct active entries.
    pub fn num_entries(&self) -> usize {
        self.lock().active.len()
    }

    /// Number of queued handles.
    pub fn num_waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    /// `wait` with no reason and default priority.
    pub async fn wait_default(
        self: &Arc<Self>,
        token: &CancellationToken,
        entry: Entry,
    ) -> Option<EntryHandle> {
        self.wait(token, entry, "", Priority::default()).await
    }

    /// Wait for admission of `entry`.
    ///
    /// Returns immediately if the entry is already active (join) or if there
    /// is room and no queued handle has higher priority. Otherwise queues
    /// until woken or until `token` is cancelled.
    ///
    /// `None` only when cancelled before admission. A token that is already
    /// cancelled still admits when no queueing is needed.
    pub async fn wait(
        self: &Arc<Self>,
        token: &CancellationToken,
        entry: Entry,
        reason: impl Into<String>,
        priority: Priority,
    ) -> Option<EntryHandle> {
        let info = HandleInfo::new(entry, reason.into(), priority);

        let admitted = {
            let mut state = self.lock();
            if state.try_admit(&info) {
                return Some(self.handle(info));
            }
            if token.is_cancelled() {
                tracing::debug!(entry = %info.entry, "Wait cancelled before queueing");
                return None;
            }
            let (wake, admitted) = oneshot::channel();
            state.waiters.insert(Waiter {
                info: Arc::clone(&info),
                wake,
            });
            tracing::debug!(
                handle = %info.id,
                entry = %info.entry,
                reason = %info.reason,
                priority = %info.priority,
                num_waiters = state.waiters.len(),
                "Queued for admission"
            );
            admitted
        };

        let mut guard = QueuedWait::new(self, &info);
        tokio::select! {
            biased;

            result = admitted => {
                if result.is_err() {
                    panic!("waiter {} dropped from index without wake", info.id);
                }
            }
            _ = token.cancelled() => {
                if self.cancel_waiter(&info) {
                    guard.disarm();
                    return None;
                }
                tracing::debug!(handle = %info.id, "Cancelled after wake - keeping admission");
            }
        }

        guard.disarm();
        Some(self.handle(info))
    }

    /// Non-blocking admission: join or take a free slot, never queue.
    pub fn try_admit(
        self: &Arc<Self>,
        entry: Entry,
        reason: impl Into<String>,
        priority: Priority,
    ) -> Option<EntryHandle> {
        let info = HandleInfo::new(entry, reason.into(), priority);
        if self.lock().try_admit(&info) {
            Some(self.handle(info))
        } else {
            None
        }
    }

    /// Snapshot of active handles and waiter counts.
    pub fn status(&self) -> TableStatus {
        let now = Instant::now();
        let state = self.lock();

        let mut entries: Vec<_> = state.active.iter().collect();
        entries.sort_by(|(l, _), (r, _)| l.display_cmp(r));
        let handles = entries
            .into_iter()
            .flat_map(|(_, set)| set.values())
            .map(|active| HandleStatus {
                id: active.info.id,
                entry: active.info.entry.clone(),
                reason: active.info.reason.clone(),
                priority: active.info.priority,
                created_at: active.info.created_at,
                age_ms: millis(now.saturating_duration_since(active.info.created)),
                expires_in_ms: handle::remaining(active.expires_at, now).map(millis),
            })
            .collect();

        TableStatus {
            max_entries: state.max_entries,
            num_entries: state.active.len(),
            num_waiters: state.waiters.len(),
            waiters_by_reason: state.waiters.counts_by_reason(),
            handles,
        }
    }

    fn handle(self: &Arc<Self>, info: Arc<HandleInfo>) -> EntryHandle {
        EntryHandle::new(info, Arc::downgrade(self))
    }

    /// Deregister a queued handle. False if a wake got to it first.
    fn cancel_waiter(&self, info: &HandleInfo) -> bool {
        let mut state = self.lock();
        if state.waiters.remove(info.id).is_some() {
            tracing::debug!(
                handle = %info.id,
                entry = %info.entry,
                num_waiters = state.waiters.len(),
                "Wait cancelled"
            );
            true
        } else {
            false
        }
    }

    pub(crate) fn timeout_for(&self, entry: &Entry) -> Duration {
        self.timeout.timeout_for(entry)
    }

    pub(crate) fn mark_expiring(&self, info: &HandleInfo, expires_at: Instant) {
        let mut state = self.lock();
        if let Some(active) = state
            .active
            .get_mut(&info.entry)
            .and_then(|set| set.get_mut(&info.id))
        {
            active.expires_at = Some(expires_at);
        }
    }

    pub(crate) fn remove(&self, info: &HandleInfo) {
        self.lock().remove(info);
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Cleans up after a `wait` future dropped while queued: deregisters the
/// waiter, or releases the handle if a wake already admitted it.
struct QueuedWait<'a> {
    table: &'a AdmissionTable,
    info: Option<Arc<HandleInfo>>,
}

impl<'a> QueuedWait<'a> {
    fn new(table: &'a AdmissionTable, info: &Arc<HandleInfo>) -> Self {
        Self {
            table,
            info: Some(Arc::clone(info)),
        }
    }

    fn disarm(&mut self) {
        self.info = None;
    }
}

impl Drop for QueuedWait<'_> {
    fn drop(&mut self) {
        let Some(info) = self.info.take() else {
            return;
        };
        let mut state = self.table.lock();
        if state.waiters.remove(info.id).is_some() {
            tracing::debug!(handle = %info.id, entry = %info.entry, "Wait dropped while queued");
        } else {
            tracing::debug!(handle = %info.id, entry = %info.entry, "Wait dropped after wake - releasing");
            state.remove(&info);
        }
    }
}
