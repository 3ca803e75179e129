//! Diagnostic snapshot of an admission table.
//!
//! Read-only; taking a snapshot never affects admission.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entry::Entry;
use crate::handle::{HandleId, Priority};

/// One active handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleStatus {
    pub id: HandleId,
    pub entry: Entry,
    pub reason: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub age_ms: u64,
    /// Time left before removal, once `done()` has been called.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    /// `None` when the table is unlimited.
    pub max_entries: Option<usize>,
    pub num_entries: usize,
    pub num_waiters: usize,
    pub waiters_by_reason: BTreeMap<String, usize>,
    /// Active handles, ordered by entry (remote, protocol, local) then arrival.
    pub handles: Vec<HandleStatus>,
}

impl TableStatus {
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_entries {
            Some(max) => writeln!(f, "num entries: {} (max {max})", self.num_entries)?,
            None => writeln!(f, "num entries: {} (unlimited)", self.num_entries)?,
        }
        writeln!(f)?;

        writeln!(f, "{} waiters:", self.num_waiters)?;
        let mut rows = vec![vec!["num".to_string(), "reason".to_string()]];
        rows.extend(
            self.waiters_by_reason
                .iter()
                .map(|(reason, num)| vec![num.to_string(), format!("{reason:?}")]),
        );
        write_columns(f, &rows)?;
        writeln!(f)?;

        writeln!(f, "handles:")?;
        let mut rows = vec![
            ["protocol", "local", "remote", "reason", "expires", "created"]
                .map(String::from)
                .to_vec(),
        ];
        rows.extend(self.handles.iter().map(|h| {
            vec![
                format!("{:?}", h.entry.protocol),
                format!("{:?}", h.entry.local_addr),
                format!("{:?}", h.entry.remote_addr),
                format!("{:?}", h.reason),
                match h.expires_in_ms {
                    Some(ms) => format!("{ms}ms"),
                    None => "not done".to_string(),
                },
                format!("{}ms ago", h.age_ms),
            ]
        }));
        write_columns(f, &rows)
    }
}

/// Left-aligned columns separated by at least two spaces.
fn write_columns(f: &mut fmt::Formatter<'_>, rows: &[Vec<String>]) -> fmt::Result {
    let mut widths: Vec<usize> = Vec::new();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            match widths.get_mut(i) {
                Some(w) => *w = (*w).max(cell.len()),
                None => widths.push(cell.len()),
            }
        }
    }
    for row in rows {
        let last = row.len().saturating_sub(1);
        for (i, cell) in row.iter().enumerate() {
            if i == last {
                write!(f, "{cell}")?;
            } else {
                write!(f, "{cell:<width$}  ", width = widths[i])?;
            }
        }
        writeln!(f)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableStatus {
        TableStatus {
            max_entries: Some(2),
            num_entries: 1,
            num_waiters: 3,
            waiters_by_reason: BTreeMap::from([("dial".to_string(), 2), ("dns".to_string(), 1)]),
            handles: vec![HandleStatus {
                id: HandleId::next(),
                entry: Entry::new("udp", "10.0.0.1:4000", "1.1.1.1:53"),
                reason: "dns".to_string(),
                priority: Priority(0),
                created_at: Utc::now(),
                age_ms: 1500,
                expires_in_ms: None,
            }],
        }
    }

    #[test]
    fn display_renders_sections() {
        let text = sample().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "num entries: 1 (max 2)");
        assert_eq!(lines[2], "3 waiters:");
        assert_eq!(lines[3], "num  reason");
        assert_eq!(lines[4], "2    \"dial\"");
        assert_eq!(lines[5], "1    \"dns\"");
        assert_eq!(lines[7], "handles:");
        assert!(lines[8].starts_with("protocol  local"));
        assert!(lines[9].contains("\"1.1.1.1:53\""));
        assert!(lines[9].contains("not done"));
        assert!(lines[9].ends_with("1500ms ago"));
    }

    #[test]
    fn display_unlimited() {
        let mut status = sample();
        status.max_entries = None;
        assert!(status.to_string().starts_with("num entries: 1 (unlimited)\n"));
    }

    #[test]
    fn json_omits_unset_expiry() {
        let json = sample().to_json().unwrap();
        assert_eq!(json["max_entries"], 2);
        assert_eq!(json["waiters_by_reason"]["dial"], 2);
        assert_eq!(json["handles"][0]["entry"]["protocol"], "udp");
        assert!(json["handles"][0].get("expires_in_ms").is_none());
    }
}
