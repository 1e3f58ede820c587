//! Offline sync queue.
//!
//! Pending remote operations run in strict FIFO order. A pass stops at the
//! first failure (unless [`DrainPolicy::SkipAndContinue`] is configured), each
//! operation gets a bounded number of attempts, and every attempt is bounded
//! by a timeout. Operation metadata is persisted through the
//! [`PersistentStore`] under [`QUEUE_STORE_KEY`]; data-described writes also
//! persist their payload so they can be rebuilt after a restart.

pub mod connectivity;
pub mod remote;

pub use connectivity::Connectivity;
pub use remote::{
    HttpRemoteStore, MemoryRemoteStore, RemoteError, RemoteErrorKind, RemoteFuture, RemoteStore,
};

use crate::config::SyncQueueConfig;
use crate::store::PersistentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vocab_core::clock::Clock;

/// Local store key holding queue metadata.
pub const QUEUE_STORE_KEY: &str = "sync_queue";

const QUEUE_FORMAT_VERSION: u32 = 1;

pub type OperationFuture = Pin<Box<dyn Future<Output = Result<(), RemoteError>> + Send>>;

/// Deferred remote operation. Called once per attempt.
pub type Action = Arc<dyn Fn() -> OperationFuture + Send + Sync>;

/// Callback run after queue-changing events.
pub type Listener = Arc<dyn Fn(&QueueStatus) + Send + Sync>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no remote store configured")]
    NoRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Progress,
    Homework,
    Submission,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Homework => "homework",
            Self::Submission => "submission",
        }
    }
}

/// What to do with the rest of a pass after an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPolicy {
    /// Stop; later operations wait for the next pass.
    #[default]
    FailFast,
    /// Leave the failed operation in place and try the ones behind it.
    SkipAndContinue,
}

/// A remote write described entirely by data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub user_id: String,
    pub collection: String,
    pub document: Value,
}

/// Durable part of a queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMeta {
    pub id: String,
    pub kind: OperationKind,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SyncPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    operations: Vec<OperationMeta>,
}

/// Most recent failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub operation_id: String,
    pub kind: OperationKind,
    pub error: String,
    pub at: DateTime<Utc>,
    /// The operation was dropped and will not be retried.
    pub dropped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub is_online: bool,
    pub is_processing: bool,
    pub queue_length: usize,
    pub oldest_operation_timestamp: Option<DateTime<Utc>>,
    pub last_failure: Option<SyncFailure>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Counts for one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// The pass did not run (offline or another pass in flight).
    pub skipped: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct PendingOperation {
    meta: OperationMeta,
    action: Action,
    executing: bool,
}

struct SyncQueueInner {
    config: SyncQueueConfig,
    clock: Arc<dyn Clock>,
    store: Option<PersistentStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    queue: Mutex<VecDeque<PendingOperation>>,
    online: AtomicBool,
    processing: AtomicBool,
    retry_scheduled: AtomicBool,
    last_failure: std::sync::Mutex<Option<SyncFailure>>,
    last_success_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    listeners: std::sync::Mutex<Vec<(SubscriptionId, Listener)>>,
    next_listener: AtomicU64,
}

/// Durable FIFO of pending remote operations.
///
/// This struct is Clone-able because it wraps all state in Arc; background
/// retries and the connectivity listener hold their own clones.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<SyncQueueInner>,
}

/// Clears the processing flag even if a pass unwinds.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Outcome {
    Succeeded,
    Failed(RemoteError),
}

impl SyncQueue {
    pub fn new(
        config: SyncQueueConfig,
        clock: Arc<dyn Clock>,
        store: Option<PersistentStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        online: bool,
    ) -> Self {
        Self {
            inner: Arc::new(SyncQueueInner {
                config,
                clock,
                store,
                remote,
                queue: Mutex::new(VecDeque::new()),
                online: AtomicBool::new(online),
                processing: AtomicBool::new(false),
                retry_scheduled: AtomicBool::new(false),
                last_failure: std::sync::Mutex::new(None),
                last_success_at: std::sync::Mutex::new(None),
                listeners: std::sync::Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    // === Enqueue ===

    /// Queue `action`. When online and no pass is running, a pass runs before
    /// this returns; otherwise the operation is parked. Always returns an id.
    pub async fn enqueue(&self, kind: OperationKind, action: Action) -> String {
        self.push(kind, action, None).await
    }

    /// Queue a data-described write to the configured remote.
    pub async fn enqueue_write(
        &self,
        kind: OperationKind,
        payload: SyncPayload,
    ) -> Result<String, QueueError> {
        let remote = self.inner.remote.clone().ok_or(QueueError::NoRemote)?;
        let action = write_action(remote, payload.clone());
        Ok(self.push(kind, action, Some(payload)).await)
    }

    /// Queue a data-described write without waiting on the remote.
    ///
    /// The operation is persisted before this returns; a pass it triggers
    /// runs on a background task.
    pub async fn enqueue_write_detached(
        &self,
        kind: OperationKind,
        payload: SyncPayload,
    ) -> Result<String, QueueError> {
        let remote = self.inner.remote.clone().ok_or(QueueError::NoRemote)?;
        let action = write_action(remote, payload.clone());
        let (id, run_now) = self.stage(kind, action, Some(payload)).await;
        self.persist().await;
        self.notify().await;
        if run_now {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.settle(true).await;
            });
        }
        Ok(id)
    }

    async fn push(&self, kind: OperationKind, action: Action, payload: Option<SyncPayload>) -> String {
        let (id, run_now) = self.stage(kind, action, payload).await;
        self.settle(run_now).await;
        id
    }

    /// Append under the lock and decide whether a pass should start now.
    async fn stage(
        &self,
        kind: OperationKind,
        action: Action,
        payload: Option<SyncPayload>,
    ) -> (String, bool) {
        let id = Uuid::new_v4().to_string();
        let meta = OperationMeta {
            id: id.clone(),
            kind,
            enqueued_at: self.inner.clock.now(),
            retry_count: 0,
            last_attempt_at: None,
            payload,
        };

        let run_now = {
            let mut queue = self.inner.queue.lock().await;
            if queue.len() >= self.inner.config.max_queue_len {
                if let Some(pos) = queue.iter().position(|op| !op.executing) {
                    if let Some(evicted) = queue.remove(pos) {
                        warn!(
                            operation_id = %evicted.meta.id,
                            kind = evicted.meta.kind.as_str(),
                            "sync queue full; evicted oldest operation"
                        );
                    }
                }
            }
            queue.push_back(PendingOperation {
                meta,
                action,
                executing: false,
            });
            self.is_online() && !self.inner.processing.load(Ordering::SeqCst)
        };

        debug!(operation_id = %id, kind = kind.as_str(), immediate = run_now, "enqueued operation");
        (id, run_now)
    }

    /// Run the pass decided at enqueue time. Connectivity or another pass may
    /// have changed since; a skipped pass still records the new operation.
    async fn settle(&self, run_now: bool) {
        if run_now && !self.process_queue().await.skipped {
            return;
        }
        self.persist().await;
        self.notify().await;
    }

    // === Processing ===

    /// Run one pass over the operations queued when it starts.
    ///
    /// A call while another pass is running, or while offline, is a no-op.
    pub async fn process_queue(&self) -> PassReport {
        if !self.is_online() {
            return PassReport {
                skipped: true,
                ..PassReport::default()
            };
        }
        if self.inner.processing.swap(true, Ordering::SeqCst) {
            return PassReport {
                skipped: true,
                ..PassReport::default()
            };
        }
        let report = {
            let _guard = ProcessingGuard(&self.inner.processing);
            self.run_pass().await
        };

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                dropped = report.dropped,
                "sync pass finished"
            );
        }
        self.persist().await;
        self.notify().await;
        if report.failed > report.dropped {
            let attempts = {
                let queue = self.inner.queue.lock().await;
                queue.iter().map(|op| op.meta.retry_count).max().unwrap_or(0)
            };
            self.schedule_retry(attempts);
        }
        report
    }

    async fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        let ids: Vec<String> = {
            let queue = self.inner.queue.lock().await;
            queue.iter().map(|op| op.meta.id.clone()).collect()
        };

        for id in ids {
            if !self.is_online() {
                break;
            }
            let action = {
                let mut queue = self.inner.queue.lock().await;
                match queue.iter_mut().find(|op| op.meta.id == id) {
                    Some(op) => {
                        op.executing = true;
                        op.action.clone()
                    }
                    // Evicted since the pass started.
                    None => continue,
                }
            };

            report.attempted += 1;
            let outcome = self.execute(action).await;
            let now = self.inner.clock.now();

            let mut queue = self.inner.queue.lock().await;
            let Some(pos) = queue.iter().position(|op| op.meta.id == id) else {
                continue;
            };

            match outcome {
                Outcome::Succeeded => {
                    queue.remove(pos);
                    report.succeeded += 1;
                    *lock_std(&self.inner.last_success_at) = Some(now);
                    debug!(operation_id = %id, "operation succeeded");
                }
                Outcome::Failed(error) => {
                    report.failed += 1;
                    let op = &mut queue[pos];
                    op.executing = false;
                    op.meta.retry_count += 1;
                    op.meta.last_attempt_at = Some(now);

                    let exhausted = op.meta.retry_count >= self.inner.config.max_attempts;
                    let dropped = error.is_permanent() || exhausted;
                    let failure = SyncFailure {
                        operation_id: id.clone(),
                        kind: op.meta.kind,
                        error: error.to_string(),
                        at: now,
                        dropped,
                    };
                    if dropped {
                        warn!(
                            operation_id = %id,
                            kind = op.meta.kind.as_str(),
                            attempts = op.meta.retry_count,
                            error = %error,
                            "dropping operation"
                        );
                        queue.remove(pos);
                        report.dropped += 1;
                    } else {
                        warn!(
                            operation_id = %id,
                            attempt = op.meta.retry_count,
                            error = %error,
                            "operation failed; will retry"
                        );
                    }
                    *lock_std(&self.inner.last_failure) = Some(failure);

                    if self.inner.config.drain_policy == DrainPolicy::FailFast && !dropped {
                        break;
                    }
                }
            }
        }
        report
    }

    /// One attempt: build the future, run it on its own task under the
    /// timeout. Panics and timeouts count as transient failures.
    async fn execute(&self, action: Action) -> Outcome {
        let future = match panic::catch_unwind(AssertUnwindSafe(|| action())) {
            Ok(future) => future,
            Err(_) => {
                return Outcome::Failed(RemoteError::new(
                    RemoteErrorKind::Unavailable,
                    "operation panicked before starting",
                ))
            }
        };

        let handle = tokio::spawn(future);
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.inner.config.operation_timeout, handle).await {
            Ok(Ok(Ok(()))) => Outcome::Succeeded,
            Ok(Ok(Err(e))) => Outcome::Failed(e),
            Ok(Err(join_error)) => Outcome::Failed(RemoteError::new(
                RemoteErrorKind::Unavailable,
                format!("operation aborted: {join_error}"),
            )),
            Err(_) => {
                abort.abort();
                Outcome::Failed(RemoteError::new(
                    RemoteErrorKind::Timeout,
                    format!(
                        "operation did not settle within {:?}",
                        self.inner.config.operation_timeout
                    ),
                ))
            }
        }
    }

    /// Exponential backoff before the next automatic pass.
    fn schedule_retry(&self, attempts: u32) {
        if !self.inner.config.auto_retry {
            return;
        }
        if attempts == 0 || self.inner.retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = self.backoff(attempts);
        debug!(delay_ms = delay.as_millis() as u64, "scheduling sync retry");

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.inner.retry_scheduled.store(false, Ordering::SeqCst);
            queue.process_queue().await;
        });
    }

    /// `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.inner
            .config
            .backoff_base
            .saturating_mul(factor)
            .min(self.inner.config.backoff_max)
    }

    // === Connectivity ===

    /// Record a connectivity change. Going online starts a pass.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        match (was_online, online) {
            (false, true) => {
                info!("connectivity restored; draining sync queue");
                self.process_queue().await;
            }
            (true, false) => {
                info!("connectivity lost; holding sync operations");
                self.notify().await;
            }
            _ => {}
        }
    }

    /// Follow a connectivity signal until its sender is dropped.
    pub fn spawn_connectivity_listener(&self, mut rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            queue.set_online(initial).await;
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                queue.set_online(online).await;
            }
        })
    }

    // === Observability ===

    pub async fn status(&self) -> QueueStatus {
        let (queue_length, oldest) = {
            let queue = self.inner.queue.lock().await;
            (queue.len(), queue.front().map(|op| op.meta.enqueued_at))
        };
        QueueStatus {
            is_online: self.is_online(),
            is_processing: self.inner.processing.load(Ordering::SeqCst),
            queue_length,
            oldest_operation_timestamp: oldest,
            last_failure: lock_std(&self.inner.last_failure).clone(),
            last_success_at: *lock_std(&self.inner.last_success_at),
        }
    }

    /// Metadata of queued operations, front first.
    pub async fn operations(&self) -> Vec<OperationMeta> {
        let queue = self.inner.queue.lock().await;
        queue.iter().map(|op| op.meta.clone()).collect()
    }

    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        lock_std(&self.inner.listeners).push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock_std(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    async fn notify(&self) {
        let listeners: Vec<Listener> = lock_std(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        let status = self.status().await;
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&status))).is_err() {
                warn!("sync queue listener panicked");
            }
        }
    }

    // === Durability ===

    async fn persist(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let operations = self.operations().await;
        let persisted = PersistedQueue {
            version: QUEUE_FORMAT_VERSION,
            operations,
        };
        match serde_json::to_string(&persisted) {
            Ok(text) => {
                store.write_raw(QUEUE_STORE_KEY, &text);
            }
            Err(e) => warn!(error = %e, "failed to serialize sync queue"),
        }
    }

    /// Rebuild persisted operations after a restart.
    ///
    /// Writes with a stored payload are re-created against the configured
    /// remote. Closure-only operations cannot be rebuilt and are discarded.
    /// Returns how many operations were restored.
    pub async fn restore(&self) -> usize {
        let Some(store) = &self.inner.store else {
            return 0;
        };
        let Some(text) = store.read_raw(QUEUE_STORE_KEY) else {
            return 0;
        };
        let persisted: PersistedQueue = match serde_json::from_str(&text) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "discarding unreadable sync queue metadata");
                return 0;
            }
        };

        let mut restored = 0;
        {
            let mut queue = self.inner.queue.lock().await;
            for meta in persisted.operations {
                if queue.iter().any(|op| op.meta.id == meta.id) {
                    continue;
                }
                let rebuilt = match (&meta.payload, &self.inner.remote) {
                    (Some(payload), Some(remote)) => write_action(remote.clone(), payload.clone()),
                    _ => {
                        warn!(
                            operation_id = %meta.id,
                            kind = meta.kind.as_str(),
                            "queued operation has no durable payload; discarding"
                        );
                        continue;
                    }
                };
                while queue.len() >= self.inner.config.max_queue_len {
                    queue.pop_front();
                }
                queue.push_back(PendingOperation {
                    meta,
                    action: rebuilt,
                    executing: false,
                });
                restored += 1;
            }
        }

        info!(restored, "restored sync queue");
        self.persist().await;
        self.notify().await;
        restored
    }
}

fn lock_std<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_action(remote: Arc<dyn RemoteStore>, payload: SyncPayload) -> Action {
    let payload = Arc::new(payload);
    Arc::new(move || -> OperationFuture {
        let remote = remote.clone();
        let payload = payload.clone();
        Box::pin(async move {
            remote
                .write(&payload.user_id, &payload.collection, &payload.document)
                .await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vocab_core::clock::FixedClock;

    fn queue(config: SyncQueueConfig) -> SyncQueue {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        SyncQueue::new(config, clock, None, None, false)
    }

    fn ok_action() -> Action {
        Arc::new(|| -> OperationFuture { Box::pin(async { Ok(()) }) })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let q = queue(SyncQueueConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            ..SyncQueueConfig::default()
        });
        assert_eq!(q.backoff(1), Duration::from_secs(1));
        assert_eq!(q.backoff(2), Duration::from_secs(2));
        assert_eq!(q.backoff(4), Duration::from_secs(8));
        assert_eq!(q.backoff(5), Duration::from_secs(10));
        assert_eq!(q.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn offline_enqueue_parks_and_reports_status() {
        let q = queue(SyncQueueConfig::default());
        q.enqueue(OperationKind::Progress, ok_action()).await;
        q.enqueue(OperationKind::Homework, ok_action()).await;

        let status = q.status().await;
        assert!(!status.is_online);
        assert_eq!(status.queue_length, 2);
        assert_eq!(
            status.oldest_operation_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
        assert!(q.process_queue().await.skipped);
    }

    #[tokio::test]
    async fn enqueue_write_requires_remote() {
        let q = queue(SyncQueueConfig::default());
        let payload = SyncPayload {
            user_id: "u".into(),
            collection: "progress".into(),
            document: Value::Null,
        };
        assert!(matches!(
            q.enqueue_write(OperationKind::Progress, payload).await,
            Err(QueueError::NoRemote)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_stops_notifications() {
        let q = queue(SyncQueueConfig::default());
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let id = q.subscribe(Arc::new(move |_: &QueueStatus| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        q.enqueue(OperationKind::Progress, ok_action()).await;
        assert!(q.unsubscribe(id));
        assert!(!q.unsubscribe(id));
        q.enqueue(OperationKind::Progress, ok_action()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skipped_immediate_pass_still_persists_and_notifies() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let store = PersistentStore::new(
            Arc::new(crate::db::MemoryKvStore::new()),
            clock.clone(),
            crate::config::StoreConfig {
                debounce: Duration::ZERO,
                ..crate::config::StoreConfig::default()
            },
        );
        let q = SyncQueue::new(SyncQueueConfig::default(), clock, Some(store.clone()), None, true);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        q.subscribe(Arc::new(move |status: &QueueStatus| {
            counter.store(status.queue_length as u64, Ordering::SeqCst);
        }));

        // Connectivity drops between the enqueue decision and the pass.
        let (_, run_now) = q.stage(OperationKind::Progress, ok_action(), None).await;
        assert!(run_now);
        q.inner.online.store(false, Ordering::SeqCst);
        q.settle(run_now).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let persisted: PersistedQueue =
            serde_json::from_str(&store.read_raw(QUEUE_STORE_KEY).unwrap()).unwrap();
        assert_eq!(persisted.operations.len(), 1);
    }
}
