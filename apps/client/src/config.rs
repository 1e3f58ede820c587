//! Runtime configuration from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::store::RetentionPolicy;
use crate::sync::DrainPolicy;
use crate::session::StreakPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("no data directory available; set VOCAB_DATA_DIR")]
    NoDataDir,
}

/// Persistent store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Quiet period before a pending snapshot is written.
    pub debounce: Duration,
    pub retention: RetentionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            retention: RetentionPolicy::KeepLatest(5),
        }
    }
}

/// Sync queue tuning.
#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    pub max_queue_len: usize,
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    pub operation_timeout: Duration,
    /// Schedule a follow-up pass after a transient failure.
    pub auto_retry: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub drain_policy: DrainPolicy,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_len: 100,
            max_attempts: 5,
            operation_timeout: Duration::from_secs(30),
            auto_retry: true,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            drain_policy: DrainPolicy::FailFast,
        }
    }
}

/// Progress orchestration settings.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub user_id: String,
    pub store_key: String,
    pub streak_policy: StreakPolicy,
    pub xp_per_correct: u32,
    pub xp_per_review: u32,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            user_id: "local".to_string(),
            store_key: "user_progress".to_string(),
            streak_policy: StreakPolicy::Strict,
            xp_per_correct: 10,
            xp_per_review: 2,
        }
    }
}

/// Everything the `vocab-sync` binary needs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub store: StoreConfig,
    pub sync: SyncQueueConfig,
    pub progress: ProgressConfig,
}

impl ClientConfig {
    /// Load `.env` if present, then read `VOCAB_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let data_dir = match non_empty("VOCAB_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join("vocab-sync"),
        };

        let mut store = StoreConfig::default();
        if let Some(ms) = parsed::<u64>("VOCAB_DEBOUNCE_MS")? {
            store.debounce = Duration::from_millis(ms);
        }
        if let Some(n) = parsed::<usize>("VOCAB_BACKUP_RETENTION")? {
            store.retention = RetentionPolicy::KeepLatest(n);
        }

        let mut sync = SyncQueueConfig::default();
        if let Some(secs) = parsed::<u64>("VOCAB_SYNC_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "VOCAB_SYNC_TIMEOUT_SECS",
                    value: secs.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            sync.operation_timeout = Duration::from_secs(secs);
        }

        let mut progress = ProgressConfig::default();
        if let Some(user) = non_empty("VOCAB_USER_ID") {
            progress.user_id = user;
        }

        Ok(Self {
            data_dir,
            remote_url: non_empty("VOCAB_REMOTE_URL"),
            remote_token: non_empty("VOCAB_REMOTE_TOKEN"),
            store,
            sync,
            progress,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("vocab.db")
    }
}

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    non_empty(var)
        .map(|value| {
            value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}
