//! conntrack: bounded admission table for connection-tracking flow entries.
//!
//! Mirrors the limited size of an OS connection-tracking table. Callers ask
//! [`AdmissionTable::wait`] for an [`Entry`] and get back an [`EntryHandle`]
//! once the entry is admitted; releasing the handle keeps the slot reserved
//! for a per-entry timeout before the capacity is reused.

mod config;
mod entry;
mod handle;
mod index;
mod status;
mod table;

pub use config::{
    ConfigError, DEFAULT_MAX_ENTRIES, DEFAULT_TIMEOUT, MAX_ENTRIES_ENV, TIMEOUT_ENV, TableConfig,
    TimeoutPolicy,
};
pub use entry::Entry;
pub use handle::{EntryHandle, HandleId, Priority};
pub use status::{HandleStatus, TableStatus};
pub use table::AdmissionTable;
pub use tokio_util::sync::CancellationToken;
