//! Persistent store adapter.
//!
//! Loads run validate, deprecated-field strip, migrate and sanitize before a
//! snapshot is trusted. Saves are debounced per key and never fail to the
//! caller: capacity errors prune backups, retry once, then log.

pub mod backup;
pub mod coalescer;

pub use backup::{BackupEntry, BackupKind, RetentionPolicy};
pub use coalescer::WriteCoalescer;

use crate::config::StoreConfig;
use crate::db::{KeyValueStore, StoreError};
use backup::{backup_key, parse_backup_key, select_expired};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use vocab_core::clock::Clock;
use vocab_core::migration::{detect_version, migrate, strip_deprecated, CURRENT_SCHEMA_VERSION};
use vocab_core::recovery::{recover, RecoveryResult};
use vocab_core::sanitize::{sanitize_snapshot, Problem};
use vocab_core::types::{PersistedState, Snapshot};
use vocab_core::validate::validate;
use vocab_core::{export_snapshot, import_snapshot};

struct StoreInner {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    coalescers: Mutex<HashMap<String, Arc<WriteCoalescer>>>,
}

/// Snapshot persistence over a [`KeyValueStore`].
///
/// Clone-able handle; debounced flushes run on spawned tasks holding a clone.
#[derive(Clone)]
pub struct PersistentStore {
    inner: Arc<StoreInner>,
}

impl PersistentStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                kv,
                clock,
                config,
                coalescers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    fn coalescer(&self, key: &str) -> Arc<WriteCoalescer> {
        let mut map = self
            .inner
            .coalescers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string()).or_default().clone()
    }

    fn coalescer_keys(&self) -> Vec<String> {
        self.inner
            .coalescers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    // === Load ===

    /// Load and normalize the snapshot under `key`.
    ///
    /// Returns `None` when nothing usable is stored; the caller starts from
    /// defaults. Unparseable text is quarantined under a `_corrupted_` key.
    pub fn load(&self, key: &str) -> Option<Snapshot> {
        let text = self.read_raw(key)?;

        let mut raw: Value = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "stored snapshot is not valid JSON");
                self.write_backup(key, BackupKind::Corrupted, &text);
                return None;
            }
        };

        let report = validate(&raw);
        for warning in &report.warnings {
            debug!(key = %key, warning = %warning, "snapshot validation warning");
        }
        if !report.is_valid {
            warn!(key = %key, errors = ?report.errors, "stored snapshot is structurally invalid; ignoring");
            return None;
        }

        let stripped = strip_deprecated(&mut raw);
        if !stripped.is_empty() {
            info!(key = %key, fields = ?stripped, "removed deprecated fields");
        }

        let from = detect_version(&raw);
        if from < CURRENT_SCHEMA_VERSION {
            self.write_backup(key, BackupKind::PreMigration, &text);
        }
        let outcome = migrate(raw, Some(from));
        if !outcome.result.migrations_applied.is_empty() {
            info!(
                key = %key,
                from,
                to = outcome.result.version,
                steps = ?outcome.result.migrations_applied,
                "migrated snapshot"
            );
        }
        for e in &outcome.result.errors {
            warn!(key = %key, error = %e, "migration issue");
        }

        let state = outcome.data.get("state").cloned().unwrap_or(Value::Null);
        let sanitized = sanitize_snapshot(&state, self.inner.clock.now());
        let repaired = sanitized
            .issues
            .iter()
            .filter(|issue| issue.problem != Problem::Missing)
            .count();
        if repaired > 0 {
            warn!(key = %key, repaired, "repaired invalid fields on load");
        }
        Some(sanitized.value)
    }

    /// Raw text under `key`, preferring a staged but unflushed write.
    pub fn read_raw(&self, key: &str) -> Option<String> {
        if let Some(pending) = self.coalescer(key).peek() {
            return Some(pending);
        }
        match self.inner.kv.get(key) {
            Ok(text) => text,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read from local store");
                None
            }
        }
    }

    // === Save ===

    /// Stage `snapshot` for writing. Inside a tokio runtime the write happens
    /// after the debounce window; otherwise it is written immediately.
    pub fn save(&self, key: &str, snapshot: &Snapshot) {
        let text = match serde_json::to_string(&PersistedState::new(snapshot.clone())) {
            Ok(text) => text,
            Err(e) => {
                error!(key = %key, error = %e, "failed to serialize snapshot");
                return;
            }
        };

        let coalescer = self.coalescer(key);
        let generation = coalescer.stage(text);
        let debounce = self.inner.config.debounce;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !debounce.is_zero() => {
                let store = self.clone();
                let key = key.to_string();
                handle.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    if let Some(text) = store.coalescer(&key).take_if_current(generation) {
                        store.write_raw(&key, &text);
                    }
                });
            }
            _ => {
                self.flush_key(key);
            }
        }
    }

    /// Write any pending snapshot for `key` now.
    pub fn flush_key(&self, key: &str) -> bool {
        match self.coalescer(key).take() {
            Some(text) => self.write_raw(key, &text),
            None => true,
        }
    }

    /// Write every pending snapshot now. Returns false if any write was dropped.
    pub fn flush(&self) -> bool {
        self.coalescer_keys()
            .iter()
            .fold(true, |ok, key| self.flush_key(key) && ok)
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.coalescer(key).has_pending()
    }

    /// Write `text` under `key` immediately. Returns false if the write was
    /// dropped; the failure is logged, never propagated.
    pub fn write_raw(&self, key: &str, text: &str) -> bool {
        match self.inner.kv.set(key, text) {
            Ok(()) => true,
            Err(e) if e.is_quota() => {
                warn!(key = %key, error = %e, "storage quota exceeded; pruning backups");
                if let Err(e) = self.prune_backups(key, RetentionPolicy::KeepLatest(0)) {
                    warn!(key = %key, error = %e, "failed to prune backups");
                }
                match self.inner.kv.set(key, text) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(key = %key, error = %e, "write dropped; in-memory state is still current");
                        false
                    }
                }
            }
            Err(e) => {
                error!(key = %key, error = %e, "write failed");
                false
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.coalescer(key).take();
        self.inner.kv.remove(key)
    }

    // === Backups ===

    fn write_backup(&self, key: &str, kind: BackupKind, text: &str) {
        let mut at = self.inner.clock.now();
        let mut side_key = backup_key(key, kind, at);
        // Two backups in the same millisecond get consecutive stamps.
        while matches!(self.inner.kv.get(&side_key), Ok(Some(_))) {
            at += chrono::Duration::milliseconds(1);
            side_key = backup_key(key, kind, at);
        }
        match self.inner.kv.set(&side_key, text) {
            Ok(()) => info!(key = %key, backup = %side_key, "wrote backup"),
            Err(e) => warn!(key = %key, error = %e, "failed to write backup"),
        }
        if let Err(e) = self.prune_backups(key, self.inner.config.retention) {
            warn!(key = %key, error = %e, "failed to prune backups");
        }
    }

    /// Backups of `key`, oldest first.
    pub fn list_backups(&self, key: &str) -> Result<Vec<BackupEntry>, StoreError> {
        let mut entries = Vec::new();
        for kind in BackupKind::ALL {
            for candidate in self.inner.kv.keys_with_prefix(&kind.prefix(key))? {
                if let Some(entry) = parse_backup_key(key, &candidate) {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        Ok(entries)
    }

    /// Delete backups of `key` outside `policy`. Returns how many were removed.
    pub fn prune_backups(&self, key: &str, policy: RetentionPolicy) -> Result<usize, StoreError> {
        let entries = self.list_backups(key)?;
        let expired = select_expired(&entries, policy, self.inner.clock.now());
        for entry in &expired {
            self.inner.kv.remove(&entry.key)?;
        }
        if !expired.is_empty() {
            debug!(key = %key, removed = expired.len(), "pruned backups");
        }
        Ok(expired.len())
    }

    /// Run recovery over the stored text, or over the newest quarantined copy
    /// if the live key is gone. A successful result is written back under `key`.
    pub fn recover_key(&self, key: &str) -> Result<RecoveryResult, StoreError> {
        let text = match self.read_raw(key) {
            Some(text) => text,
            None => {
                let newest_corrupted = self
                    .list_backups(key)?
                    .into_iter()
                    .rev()
                    .find(|e| e.kind == BackupKind::Corrupted);
                match newest_corrupted {
                    Some(entry) => self.inner.kv.get(&entry.key)?.unwrap_or_default(),
                    None => String::new(),
                }
            }
        };

        let result = recover(&text, self.inner.clock.now());
        if let Some(data) = &result.recovered_data {
            let recovered = serde_json::to_string(data)?;
            if self.write_raw(key, &recovered) {
                info!(
                    key = %key,
                    partial = result.partial_recovery,
                    lost = result.lost_data.len(),
                    "restored recovered snapshot"
                );
            }
        } else {
            warn!(key = %key, errors = ?result.errors, "recovery failed");
        }
        Ok(result)
    }

    // === Export / import ===

    pub fn export(&self, snapshot: &Snapshot) -> Result<String, StoreError> {
        Ok(export_snapshot(snapshot, self.inner.clock.now())?)
    }

    pub fn export_to_file(&self, path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
        let text = self.export(snapshot)?;
        std::fs::write(path, text)?;
        info!(path = %path.display(), "exported snapshot");
        Ok(())
    }

    /// Import is recovery over file contents; nothing is written.
    pub fn import(&self, text: &str) -> RecoveryResult {
        import_snapshot(text, self.inner.clock.now())
    }

    pub fn import_file(&self, path: &Path) -> Result<RecoveryResult, StoreError> {
        let text = std::fs::read_to_string(path)?;
        Ok(self.import(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryKvStore;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use vocab_core::clock::FixedClock;
    use vocab_core::types::CardState;

    const KEY: &str = "user_progress";

    fn fixture(debounce: Duration) -> (PersistentStore, Arc<MemoryKvStore>, Arc<FixedClock>) {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let config = StoreConfig {
            debounce,
            ..StoreConfig::default()
        };
        let store = PersistentStore::new(kv.clone(), clock.clone(), config);
        (store, kv, clock)
    }

    fn sample_snapshot(clock: &FixedClock) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot
            .progress
            .insert("logos".into(), CardState::new("logos", clock.now()));
        snapshot.stats.xp = 30;
        snapshot
    }

    #[test]
    fn absent_key_loads_none() {
        let (store, _, _) = fixture(Duration::ZERO);
        assert_eq!(store.load(KEY), None);
    }

    #[test]
    fn save_without_runtime_writes_immediately() {
        let (store, kv, clock) = fixture(Duration::from_millis(250));
        let snapshot = sample_snapshot(&clock);
        store.save(KEY, &snapshot);
        assert!(kv.get(KEY).unwrap().is_some());
        assert_eq!(store.load(KEY), Some(snapshot));
    }

    #[test]
    fn corrupted_text_is_quarantined() {
        let (store, kv, _) = fixture(Duration::ZERO);
        kv.set(KEY, "{\"state\": {\"stats\": ").unwrap();
        assert_eq!(store.load(KEY), None);
        let backups = store.list_backups(KEY).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].kind, BackupKind::Corrupted);
        assert_eq!(
            kv.get(&backups[0].key).unwrap().as_deref(),
            Some("{\"state\": {\"stats\": ")
        );
    }

    #[test]
    fn structurally_invalid_snapshot_loads_none() {
        let (store, kv, _) = fixture(Duration::ZERO);
        kv.set(KEY, r#"{"state": {"stats": [], "progress": {}}}"#).unwrap();
        assert_eq!(store.load(KEY), None);
        assert!(store.list_backups(KEY).unwrap().is_empty());
    }

    #[test]
    fn old_snapshot_is_backed_up_migrated_and_sanitized() {
        let (store, kv, _) = fixture(Duration::ZERO);
        let old = json!({
            "state": {
                "stats": {"xp": 900, "streak": 4, "longestStreak": 2},
                "progress": {"logos": {"easeFactor": 4.2, "interval": 3, "timesReviewed": 1, "timesCorrect": 3,
                                        "nextReviewAt": "2024-05-02T00:00:00Z"}},
                "reviewQueue": ["logos"]
            }
        })
        .to_string();
        kv.set(KEY, &old).unwrap();

        let snapshot = store.load(KEY).unwrap();
        assert_eq!(snapshot.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(snapshot.stats.level, 4);
        assert_eq!(snapshot.stats.longest_streak, 4);
        let card = &snapshot.progress["logos"];
        assert_eq!(card.ease_factor, 3.0);
        assert_eq!(card.times_correct, 1);

        let backups = store.list_backups(KEY).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].kind, BackupKind::PreMigration);
        assert_eq!(kv.get(&backups[0].key).unwrap(), Some(old));
    }

    #[test]
    fn backups_are_pruned_to_retention() {
        let (store, kv, clock) = fixture(Duration::ZERO);
        for _ in 0..8 {
            kv.set(KEY, "not json").unwrap();
            store.load(KEY);
            clock.advance(ChronoDuration::minutes(1));
        }
        assert_eq!(store.list_backups(KEY).unwrap().len(), 5);

        let removed = store
            .prune_backups(KEY, RetentionPolicy::MaxAge(ChronoDuration::minutes(3)))
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn quota_failure_prunes_backups_then_retries() {
        let (store, kv, clock) = fixture(Duration::ZERO);
        kv.set("user_progress_backup_1", &"x".repeat(1_200)).unwrap();
        kv.set_quota(Some(1_500));

        let snapshot = sample_snapshot(&clock);
        store.save(KEY, &snapshot);
        assert!(kv.get("user_progress_backup_1").unwrap().is_none());
        assert_eq!(store.load(KEY), Some(snapshot));
    }

    #[test]
    fn quota_failure_never_propagates() {
        let (store, kv, clock) = fixture(Duration::ZERO);
        kv.set_quota(Some(10));
        store.save(KEY, &sample_snapshot(&clock));
        assert!(kv.get(KEY).unwrap().is_none());
        assert!(!store.has_pending(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_saves_coalesce_into_latest() {
        let (store, kv, clock) = fixture(Duration::from_millis(250));
        let mut snapshot = sample_snapshot(&clock);
        for xp in 1..=5 {
            snapshot.stats.xp = xp;
            store.save(KEY, &snapshot);
        }
        assert!(kv.get(KEY).unwrap().is_none());
        // Reads see the staged value before it lands.
        assert_eq!(store.load(KEY).unwrap().stats.xp, 5);

        tokio::time::sleep(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;
        let written: Value = serde_json::from_str(&kv.get(KEY).unwrap().unwrap()).unwrap();
        assert_eq!(written["state"]["stats"]["xp"], json!(5));
        assert!(!store.has_pending(KEY));
    }

    #[tokio::test]
    async fn flush_writes_pending_immediately() {
        let (store, kv, clock) = fixture(Duration::from_secs(60));
        store.save(KEY, &sample_snapshot(&clock));
        store.save("session", &Snapshot::default());
        assert!(store.flush());
        assert!(kv.get(KEY).unwrap().is_some());
        assert!(kv.get("session").unwrap().is_some());
    }

    #[test]
    fn recover_key_uses_quarantined_copy() {
        let (store, kv, _) = fixture(Duration::ZERO);
        kv.set(KEY, r#"{"state":{"stats":{"xp":NaN,"level":1},"progress":{"#).unwrap();
        assert_eq!(store.load(KEY), None);
        kv.remove(KEY).unwrap();

        let result = store.recover_key(KEY).unwrap();
        assert!(result.success && result.recovered);
        let restored = store.load(KEY).unwrap();
        assert_eq!(restored.stats.xp, 0);
    }

    #[test]
    fn export_file_imports_back() {
        let (store, _, clock) = fixture(Duration::ZERO);
        let snapshot = sample_snapshot(&clock);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        store.export_to_file(&path, &snapshot).unwrap();

        let result = store.import_file(&path).unwrap();
        assert!(result.success);
        assert_eq!(result.recovered_data.unwrap().state, snapshot);
    }
}
