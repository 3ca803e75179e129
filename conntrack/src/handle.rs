//! Entry handles: one logical reservation of an entry's slot.
//!
//! A handle returned from [`AdmissionTable::wait`] is active until released.
//! Release is delayed by the table's timeout policy, modeling the time the
//! kernel keeps a conntrack entry around after the flow is gone:
//! - `done()` → removal after `timeout(entry)`
//! - `forget()` → immediate removal
//! - drop without either → same as `done()`, with a warning

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entry::Entry;
use crate::table::AdmissionTable;

/// Admission priority. Larger values win contention for free capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const MIN: Self = Self(i32::MIN);
    pub const MAX: Self = Self(i32::MAX);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a handle. Allocated in increasing order, so comparing ids
/// compares arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable part of a handle, shared between the caller's `EntryHandle`
/// and the table's indices.
#[derive(Debug)]
pub(crate) struct HandleInfo {
    pub id: HandleId,
    pub entry: Entry,
    pub reason: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub created: Instant,
}

impl HandleInfo {
    pub(crate) fn new(entry: Entry, reason: String, priority: Priority) -> Arc<Self> {
        Arc::new(Self {
            id: HandleId::next(),
            entry,
            reason,
            priority,
            created_at: Utc::now(),
            created: Instant::now(),
        })
    }
}

/// An admitted reservation of an [`Entry`]'s capacity slot.
///
/// Holds only a weak reference to its table; releasing a handle after the
/// table is gone is a no-op.
#[must_use = "dropping an EntryHandle releases it; call done() to make that explicit"]
pub struct EntryHandle {
    info: Arc<HandleInfo>,
    table: Weak<AdmissionTable>,
    released: bool,
}

impl EntryHandle {
    pub(crate) fn new(info: Arc<HandleInfo>, table: Weak<AdmissionTable>) -> Self {
        Self {
            info,
            table,
            released: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.info.id
    }

    pub fn entry(&self) -> &Entry {
        &self.info.entry
    }

    pub fn reason(&self) -> &str {
        &self.info.reason
    }

    pub fn priority(&self) -> Priority {
        self.info.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.info.created_at
    }

    /// Release the handle. The slot stays reserved for the table's timeout
    /// for this entry, then the handle is removed.
    pub fn done(mut self) {
        self.released = true;
        self.schedule_removal();
    }

    /// Release the handle and remove it immediately, skipping the timeout.
    pub fn forget(mut self) {
        self.released = true;
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.info);
        }
    }

    fn schedule_removal(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let timeout = table.timeout_for(&self.info.entry);
        if timeout.is_zero() {
            table.remove(&self.info);
            return;
        }
        let expires_at = Instant::now() + timeout;
        table.mark_expiring(&self.info, expires_at);
        drop(table);

        tracing::trace!(
            handle = %self.info.id,
            entry = %self.info.entry,
            ?timeout,
            "Scheduled handle removal"
        );
        let pending = PendingRemoval {
            table: self.table.clone(),
            info: Arc::clone(&self.info),
            expires_at,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    drop(pending);
                });
            }
            // One sleeping thread per released handle. Only hit when `done()`
            // runs outside a tokio runtime.
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(timeout);
                    drop(pending);
                });
            }
        }
    }
}

/// Removes an expiring handle when dropped: either after its timer fires, or
/// when the runtime drops the timer task on shutdown. A lost timer must not
/// hold the entry's slot forever.
struct PendingRemoval {
    table: Weak<AdmissionTable>,
    info: Arc<HandleInfo>,
    expires_at: Instant,
}

impl Drop for PendingRemoval {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            tracing::trace!(handle = %self.info.id, "Table gone before handle expiry");
            return;
        };
        if Instant::now() < self.expires_at {
            tracing::debug!(
                handle = %self.info.id,
                entry = %self.info.entry,
                "Expiry timer dropped early - removing handle now"
            );
        }
        table.remove(&self.info);
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("id", &self.info.id)
            .field("entry", &self.info.entry)
            .field("reason", &self.info.reason)
            .field("priority", &self.info.priority)
            .finish()
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                handle = %self.info.id,
                entry = %self.info.entry,
                "EntryHandle dropped without done() - releasing"
            );
            self.schedule_removal();
        }
    }
}

/// How long a released handle keeps its slot, as seen in status output.
pub(crate) fn remaining(expires_at: Option<Instant>, now: Instant) -> Option<Duration> {
    expires_at.map(|at| at.saturating_duration_since(now))
}
