//! Sync queue tests.
//!
//! Run entirely in-process against `MemoryRemoteStore` and a paused clock
//! where timing matters.

mod common;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::Notify;

use common::fixtures;
use common::TestContext;
use vocab_client::sync::{Connectivity, QueueStatus, RemoteErrorKind, QUEUE_STORE_KEY};
use vocab_client::{DrainPolicy, OperationKind, SyncQueueConfig};

/// Operations queued offline run in enqueue order once connectivity returns.
#[tokio::test]
async fn test_offline_operations_drain_in_fifo_order() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), false);
    let log = fixtures::log();

    for name in ["A", "B", "C"] {
        queue
            .enqueue(OperationKind::Progress, fixtures::recording(&log, name))
            .await;
    }
    assert!(fixtures::entries(&log).is_empty());
    assert_eq!(queue.status().await.queue_length, 3);

    queue.set_online(true).await;

    assert_eq!(fixtures::entries(&log), vec!["A", "B", "C"]);
    let status = queue.status().await;
    assert_eq!(status.queue_length, 0);
    assert_eq!(status.oldest_operation_timestamp, None);
    assert!(status.last_success_at.is_some());
}

/// An operation that always fails is attempted exactly `max_attempts` times.
#[tokio::test]
async fn test_retry_bound_drops_after_five_attempts() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), true);
    let attempts = Arc::new(AtomicU32::new(0));

    queue
        .enqueue(
            OperationKind::Progress,
            fixtures::failing(&attempts, RemoteErrorKind::Network),
        )
        .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    for _ in 0..10 {
        queue.process_queue().await;
    }

    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    let status = queue.status().await;
    assert_eq!(status.queue_length, 0);
    let failure = status.last_failure.unwrap();
    assert!(failure.dropped);
    assert_eq!(failure.kind, OperationKind::Progress);
}

/// Permanent errors are not retried.
#[tokio::test]
async fn test_permanent_failure_is_dropped_immediately() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), true);
    let attempts = Arc::new(AtomicU32::new(0));

    queue
        .enqueue(
            OperationKind::Submission,
            fixtures::failing(&attempts, RemoteErrorKind::PermissionDenied),
        )
        .await;
    queue.process_queue().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(queue.status().await.queue_length, 0);
}

/// With fail-fast draining, a failure blocks the operations behind it.
#[tokio::test]
async fn test_fail_fast_stops_pass_at_first_failure() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), false);
    let attempts = Arc::new(AtomicU32::new(0));
    let log = fixtures::log();

    queue
        .enqueue(
            OperationKind::Progress,
            fixtures::failing(&attempts, RemoteErrorKind::Unavailable),
        )
        .await;
    queue
        .enqueue(OperationKind::Homework, fixtures::recording(&log, "B"))
        .await;

    queue.set_online(true).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(fixtures::entries(&log).is_empty());
    let ops = queue.operations().await;
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].retry_count, 1);
    assert!(ops[0].last_attempt_at.is_some());
    assert_eq!(ops[1].retry_count, 0);
}

/// Skip-and-continue leaves the failure in place and runs the rest.
#[tokio::test]
async fn test_skip_and_continue_runs_later_operations() {
    let ctx = TestContext::new();
    let config = SyncQueueConfig {
        drain_policy: DrainPolicy::SkipAndContinue,
        ..fixtures::manual_config()
    };
    let queue = ctx.queue(config, false);
    let attempts = Arc::new(AtomicU32::new(0));
    let log = fixtures::log();

    queue
        .enqueue(
            OperationKind::Progress,
            fixtures::failing(&attempts, RemoteErrorKind::Unavailable),
        )
        .await;
    queue
        .enqueue(OperationKind::Homework, fixtures::recording(&log, "B"))
        .await;

    let report = queue.process_queue().await;
    assert!(report.skipped);

    queue.set_online(true).await;

    assert_eq!(fixtures::entries(&log), vec!["B"]);
    let ops = queue.operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Progress);
}

/// An operation that never settles is cut off by the timeout and kept for retry.
#[tokio::test(start_paused = true)]
async fn test_hanging_operation_times_out() {
    let ctx = TestContext::new();
    let config = SyncQueueConfig {
        operation_timeout: Duration::from_secs(30),
        ..fixtures::manual_config()
    };
    let queue = ctx.queue(config, false);
    queue.enqueue(OperationKind::Progress, fixtures::hanging()).await;

    let started = tokio::time::Instant::now();
    queue.set_online(true).await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(3600));

    let status = queue.status().await;
    assert_eq!(status.queue_length, 1);
    assert!(!status.is_processing);
    let failure = status.last_failure.unwrap();
    assert!(!failure.dropped);
    assert!(failure.error.starts_with("timeout"));
}

/// A panicking operation counts as a failed attempt and does not wedge the queue.
#[tokio::test]
async fn test_panicking_operation_is_contained() {
    let ctx = TestContext::new();
    let config = SyncQueueConfig {
        drain_policy: DrainPolicy::SkipAndContinue,
        ..fixtures::manual_config()
    };
    let queue = ctx.queue(config, false);
    let log = fixtures::log();

    queue.enqueue(OperationKind::Progress, fixtures::panicking()).await;
    queue
        .enqueue(OperationKind::Progress, fixtures::recording(&log, "after"))
        .await;
    queue.set_online(true).await;

    assert_eq!(fixtures::entries(&log), vec!["after"]);
    let status = queue.status().await;
    assert!(!status.is_processing);
    assert_eq!(status.queue_length, 1);
    assert_eq!(queue.operations().await[0].retry_count, 1);
}

/// An action that panics before producing its future follows the retry bound.
#[tokio::test]
async fn test_action_panicking_before_future_is_retried() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), true);
    let attempts = Arc::new(AtomicU32::new(0));

    queue
        .enqueue(OperationKind::Progress, fixtures::panicking_on_call(&attempts))
        .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(queue.status().await.queue_length, 1);

    for _ in 0..10 {
        queue.process_queue().await;
    }

    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    let status = queue.status().await;
    assert_eq!(status.queue_length, 0);
    assert!(status.last_failure.unwrap().dropped);
}

/// A full queue evicts its oldest entry to admit a new one.
#[tokio::test]
async fn test_full_queue_evicts_oldest() {
    let ctx = TestContext::new();
    let config = SyncQueueConfig {
        max_queue_len: 3,
        ..fixtures::manual_config()
    };
    let queue = ctx.queue(config, false);
    let log = fixtures::log();

    let mut ids = Vec::new();
    for name in ["1", "2", "3", "4"] {
        ids.push(
            queue
                .enqueue(OperationKind::Progress, fixtures::recording(&log, name))
                .await,
        );
    }

    let queued: Vec<String> = queue.operations().await.into_iter().map(|op| op.id).collect();
    assert_eq!(queued, ids[1..].to_vec());

    queue.set_online(true).await;
    assert_eq!(fixtures::entries(&log), vec!["2", "3", "4"]);
}

/// A second trigger while a pass is in flight is a no-op.
#[tokio::test]
async fn test_overlapping_pass_is_skipped() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), false);
    let gate = Arc::new(Notify::new());
    queue.enqueue(OperationKind::Progress, fixtures::gated(&gate)).await;

    let background = queue.clone();
    let pass = tokio::spawn(async move { background.set_online(true).await });
    while !queue.status().await.is_processing {
        tokio::task::yield_now().await;
    }

    assert!(queue.process_queue().await.skipped);

    gate.notify_one();
    pass.await.unwrap();
    let status = queue.status().await;
    assert!(!status.is_processing);
    assert_eq!(status.queue_length, 0);
}

/// Transient failures are retried automatically after the backoff delay.
#[tokio::test(start_paused = true)]
async fn test_auto_retry_after_backoff() {
    let ctx = TestContext::new();
    let config = SyncQueueConfig {
        backoff_base: Duration::from_secs(1),
        ..SyncQueueConfig::default()
    };
    let queue = ctx.queue(config, true);
    ctx.remote.fail_next(RemoteErrorKind::Network, 1);

    queue
        .enqueue_write(OperationKind::Progress, fixtures::progress_payload(10))
        .await
        .unwrap();
    assert!(ctx.remote.writes().is_empty());
    assert_eq!(queue.status().await.queue_length, 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(ctx.remote.writes().len(), 1);
    assert_eq!(queue.status().await.queue_length, 0);
    assert_eq!(
        ctx.remote.document("learner-1", "progress").unwrap()["stats"]["xp"],
        10
    );
}

/// Data-described writes survive a restart; closure-only operations do not.
#[tokio::test]
async fn test_restore_rebuilds_payload_operations() {
    let ctx = TestContext::new();
    let first = ctx.queue(fixtures::manual_config(), false);
    let log = fixtures::log();

    first
        .enqueue_write(OperationKind::Progress, fixtures::progress_payload(42))
        .await
        .unwrap();
    first
        .enqueue(OperationKind::Homework, fixtures::recording(&log, "closure"))
        .await;
    assert!(ctx.kv_has(QUEUE_STORE_KEY));

    let restarted = ctx.queue(fixtures::manual_config(), false);
    assert_eq!(restarted.restore().await, 1);
    let ops = restarted.operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].payload, Some(fixtures::progress_payload(42)));

    restarted.set_online(true).await;
    assert_eq!(ctx.remote.writes().len(), 1);
    assert!(fixtures::entries(&log).is_empty());
}

/// Listeners see queue changes; a panicking listener is isolated.
#[tokio::test]
async fn test_listeners_are_notified() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), false);
    let seen = Arc::new(AtomicUsize::new(0));

    queue.subscribe(Arc::new(|_: &QueueStatus| panic!("listener bug")));
    let counter = seen.clone();
    queue.subscribe(Arc::new(move |status: &QueueStatus| {
        counter.store(status.queue_length, Ordering::SeqCst);
    }));

    let log = fixtures::log();
    queue.enqueue(OperationKind::Progress, fixtures::recording(&log, "A")).await;
    queue.enqueue(OperationKind::Progress, fixtures::recording(&log, "B")).await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    queue.set_online(true).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

/// The connectivity listener drains the queue when the signal flips online.
#[tokio::test]
async fn test_connectivity_signal_drives_queue() {
    let ctx = TestContext::new();
    let queue = ctx.queue(fixtures::manual_config(), false);
    let connectivity = Connectivity::new(false);
    let listener = queue.spawn_connectivity_listener(connectivity.subscribe());

    let log = fixtures::log();
    queue.enqueue(OperationKind::Progress, fixtures::recording(&log, "A")).await;
    assert!(fixtures::entries(&log).is_empty());

    connectivity.set_online(true);
    for _ in 0..100 {
        if !fixtures::entries(&log).is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(fixtures::entries(&log), vec!["A"]);
    assert!(queue.is_online());

    drop(connectivity);
    listener.await.unwrap();
}
