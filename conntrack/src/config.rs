//! Table configuration: capacity and the release timeout policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::entry::Entry;

/// A quarter of the commonly quoted absolute max on a Linux system.
pub const DEFAULT_MAX_ENTRIES: usize = 1 << 14;

/// UDP is the main offender, and its kernel default is allegedly 30s.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const MAX_ENTRIES_ENV: &str = "CONNTRACK_MAX_ENTRIES";
pub const TIMEOUT_ENV: &str = "CONNTRACK_TIMEOUT_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid CONNTRACK_MAX_ENTRIES '{0}': expected a non-negative integer or 'unlimited'")]
    InvalidMaxEntries(String),
    #[error("invalid CONNTRACK_TIMEOUT_MS '{0}': expected a whole number of milliseconds")]
    InvalidTimeout(String),
}

/// How long a released handle keeps its entry's slot reserved.
#[derive(Clone)]
pub struct TimeoutPolicy(Arc<dyn Fn(&Entry) -> Duration + Send + Sync>);

impl TimeoutPolicy {
    /// Same timeout for every entry.
    pub fn fixed(timeout: Duration) -> Self {
        Self::from_fn(move |_| timeout)
    }

    pub fn from_fn(f: impl Fn(&Entry) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn timeout_for(&self, entry: &Entry) -> Duration {
        (self.0)(entry)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_TIMEOUT)
    }
}

impl fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimeoutPolicy(..)")
    }
}

/// Construction parameters for an [`AdmissionTable`](crate::AdmissionTable).
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Maximum number of distinct active entries. `None` means unlimited.
    pub max_entries: Option<usize>,
    pub timeout: TimeoutPolicy,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_entries: Some(DEFAULT_MAX_ENTRIES),
            timeout: TimeoutPolicy::default(),
        }
    }
}

impl TableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn with_no_max_entries(mut self) -> Self {
        self.max_entries = None;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    /// Defaults overridden by `CONNTRACK_MAX_ENTRIES` and `CONNTRACK_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(MAX_ENTRIES_ENV) {
            config.max_entries = match raw.trim() {
                "unlimited" => None,
                value => Some(
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidMaxEntries(raw.clone()))?,
                ),
            };
        }

        if let Some(raw) = lookup(TIMEOUT_ENV) {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidTimeout(raw.clone()))?;
            config.timeout = TimeoutPolicy::fixed(Duration::from_millis(millis));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn udp() -> Entry {
        Entry::new("udp", "0.0.0.0:1", "1.1.1.1:53")
    }

    #[test]
    fn defaults() {
        let config = TableConfig::default();
        assert_eq!(config.max_entries, Some(16384));
        assert_eq!(config.timeout.timeout_for(&udp()), Duration::from_secs(30));
    }

    #[test]
    fn env_overrides() {
        let config =
            TableConfig::from_lookup(lookup(&[(MAX_ENTRIES_ENV, "64"), (TIMEOUT_ENV, "250")]))
                .unwrap();
        assert_eq!(config.max_entries, Some(64));
        assert_eq!(config.timeout.timeout_for(&udp()), Duration::from_millis(250));
    }

    #[test]
    fn env_unlimited() {
        let config = TableConfig::from_lookup(lookup(&[(MAX_ENTRIES_ENV, "unlimited")])).unwrap();
        assert_eq!(config.max_entries, None);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = TableConfig::from_lookup(lookup(&[(MAX_ENTRIES_ENV, "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMaxEntries(ref v) if v == "-1"));
        assert_eq!(
            err.to_string(),
            "invalid CONNTRACK_MAX_ENTRIES '-1': expected a non-negative integer or 'unlimited'"
        );

        let err = TableConfig::from_lookup(lookup(&[(TIMEOUT_ENV, "1.5s")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeout(_)));
    }

    #[test]
    fn per_entry_policy() {
        let policy = TimeoutPolicy::from_fn(|entry| {
            if entry.protocol == "udp" {
                Duration::from_secs(30)
            } else {
                Duration::ZERO
            }
        });
        assert_eq!(policy.timeout_for(&udp()), Duration::from_secs(30));
        assert_eq!(
            policy.timeout_for(&Entry::new("tcp", "a:1", "b:2")),
            Duration::ZERO
        );
    }

    #[test]
    fn builder() {
        let config = TableConfig::new().with_max_entries(3).with_no_max_entries();
        assert_eq!(config.max_entries, None);
        let config = config.with_max_entries(0);
        assert_eq!(config.max_entries, Some(0));
    }
}
