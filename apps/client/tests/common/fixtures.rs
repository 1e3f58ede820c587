//! Test fixtures and factory functions for queue operations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;

use vocab_client::sync::{
    Action, OperationFuture, RemoteError, RemoteErrorKind, RemoteFuture, RemoteStore, SyncPayload,
};
use vocab_client::SyncQueueConfig;

/// Names of completed operations, in completion order.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Queue config without background retries, so tests drive every pass.
pub fn manual_config() -> SyncQueueConfig {
    SyncQueueConfig {
        auto_retry: false,
        ..SyncQueueConfig::default()
    }
}

/// Succeeds and appends `name` to `log`.
pub fn recording(log: &Log, name: &str) -> Action {
    let log = log.clone();
    let name = name.to_string();
    Arc::new(move || -> OperationFuture {
        let log = log.clone();
        let name = name.clone();
        Box::pin(async move {
            log.lock().unwrap().push(name);
            Ok(())
        })
    })
}

/// Always fails with `kind`, counting attempts.
pub fn failing(attempts: &Arc<AtomicU32>, kind: RemoteErrorKind) -> Action {
    let attempts = attempts.clone();
    Arc::new(move || -> OperationFuture {
        attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Err(RemoteError::new(kind, "remote rejected write")) })
    })
}

/// Never settles on its own.
pub fn hanging() -> Action {
    Arc::new(|| -> OperationFuture {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
    })
}

/// Waits until `gate` is notified.
pub fn gated(gate: &Arc<Notify>) -> Action {
    let gate = gate.clone();
    Arc::new(move || -> OperationFuture {
        let gate = gate.clone();
        Box::pin(async move {
            gate.notified().await;
            Ok(())
        })
    })
}

async fn blow_up() -> Result<(), RemoteError> {
    panic!("operation blew up")
}

/// Panics while the operation runs.
pub fn panicking() -> Action {
    Arc::new(|| -> OperationFuture { Box::pin(blow_up()) })
}

/// Panics while building its future, counting attempts.
pub fn panicking_on_call(attempts: &Arc<AtomicU32>) -> Action {
    let attempts = attempts.clone();
    Arc::new(move || -> OperationFuture {
        attempts.fetch_add(1, Ordering::SeqCst);
        panic!("operation could not be built")
    })
}

/// Remote whose writes never settle.
pub struct HangingRemote;

impl RemoteStore for HangingRemote {
    fn write<'a>(
        &'a self,
        _user_id: &'a str,
        _collection: &'a str,
        _document: &'a Value,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
    }

    fn read<'a>(&'a self, _user_id: &'a str, _collection: &'a str) -> RemoteFuture<'a, Option<Value>> {
        Box::pin(async { Ok(None) })
    }
}

pub fn progress_payload(xp: u64) -> SyncPayload {
    SyncPayload {
        user_id: "learner-1".to_string(),
        collection: "progress".to_string(),
        document: json!({ "stats": { "xp": xp } }),
    }
}
