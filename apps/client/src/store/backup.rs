//! Timestamped side-keys kept next to a snapshot.
//!
//! `<key>_backup_<ms>` is written before a migration rewrites old data and
//! `<key>_corrupted_<ms>` holds text that failed to parse. Timestamps are Unix
//! milliseconds.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    PreMigration,
    Corrupted,
}

impl BackupKind {
    pub const ALL: [BackupKind; 2] = [BackupKind::PreMigration, BackupKind::Corrupted];

    fn infix(self) -> &'static str {
        match self {
            Self::PreMigration => "_backup_",
            Self::Corrupted => "_corrupted_",
        }
    }

    pub fn prefix(self, key: &str) -> String {
        format!("{key}{}", self.infix())
    }
}

/// How many backups to keep per snapshot key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    KeepLatest(usize),
    MaxAge(Duration),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepLatest(5)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub key: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
}

pub fn backup_key(key: &str, kind: BackupKind, at: DateTime<Utc>) -> String {
    format!("{}{}", kind.prefix(key), at.timestamp_millis())
}

/// Parse a side-key back into an entry, if it belongs to `key`.
pub fn parse_backup_key(key: &str, candidate: &str) -> Option<BackupEntry> {
    BackupKind::ALL.into_iter().find_map(|kind| {
        let millis = candidate.strip_prefix(&kind.prefix(key))?.parse::<i64>().ok()?;
        Some(BackupEntry {
            key: candidate.to_string(),
            kind,
            created_at: DateTime::from_timestamp_millis(millis)?,
        })
    })
}

/// Entries to delete under `policy`. `entries` must be sorted oldest first.
pub fn select_expired(
    entries: &[BackupEntry],
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<BackupEntry> {
    match policy {
        RetentionPolicy::KeepLatest(n) => {
            let excess = entries.len().saturating_sub(n);
            entries[..excess].to_vec()
        }
        RetentionPolicy::MaxAge(age) => entries
            .iter()
            .filter(|e| e.created_at < now - age)
            .cloned()
            .collect(),
    }
}
