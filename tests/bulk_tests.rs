//! Tests for bulk processing.

use parking_lot::Mutex;
use sportsdata_client::bulk::batch_sizes;
use sportsdata_client::{
    BatchProgress, BulkOptions, BulkOrchestrator, DispatchMode, FetchError, NoProgress,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_case::test_case;
use tokio_util::sync::CancellationToken;

fn options(batch_size: usize, max_concurrency: usize) -> BulkOptions {
    BulkOptions::default()
        .batch_size(batch_size)
        .max_concurrency(max_concurrency)
}

#[test_case(25, 10, &[10, 10, 5] ; "uneven tail")]
#[test_case(30, 10, &[10, 10, 10] ; "exact multiple")]
#[test_case(4, 10, &[4] ; "single short batch")]
fn test_batch_sizes(total: usize, size: usize, expected: &[usize]) {
    assert_eq!(batch_sizes(total, size), expected);
}

#[tokio::test(start_paused = true)]
async fn test_all_items_accounted_for() {
    let orchestrator = BulkOrchestrator::default();
    let snapshots = Mutex::new(Vec::<BatchProgress>::new());
    let observer = |p: &BatchProgress| snapshots.lock().push(p.clone());

    let outcome = orchestrator
        .process_in_batches(
            (0..25).collect(),
            &options(10, 4),
            |n: u32, _| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if n % 7 == 3 {
                    Err(FetchError::transient("flaky", Some(503)))
                } else {
                    Ok(n * 2)
                }
            },
            &observer,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.total_items, 25);
    assert_eq!(outcome.completed_items + outcome.failed_items, 25);
    // 3, 10, 17, 24
    assert_eq!(outcome.failed_items, 4);
    assert_eq!(outcome.results.len(), 21);
    assert_eq!(outcome.errors.len(), 4);

    let snapshots = snapshots.lock();
    assert_eq!(snapshots.len(), 25);
    assert!(snapshots.iter().all(|p| p.job_id == outcome.job_id));
    let last = snapshots.last().unwrap();
    assert!(last.is_completed);
    assert_eq!(last.estimated_remaining, Duration::ZERO);
}

#[tokio::test]
async fn test_continue_on_error_collects_failures() {
    let orchestrator = BulkOrchestrator::default();

    let outcome = orchestrator
        .process_in_batches(
            vec![1u32, 2, 3],
            &options(10, 4),
            |n, _| async move {
                if n == 2 {
                    Err(FetchError::permanent("item 2 is bad", Some(400)))
                } else {
                    Ok(n)
                }
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.completed_items, 2);
    assert_eq!(outcome.failed_items, 1);
    let mut results = outcome.results.clone();
    results.sort_unstable();
    assert_eq!(results, vec![1, 3]);
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(
        &outcome.errors[0],
        FetchError::BatchItem { index: 1, message } if message.contains("item 2 is bad")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_stops_outstanding_work() {
    let orchestrator = BulkOrchestrator::default();
    let finished = Arc::new(AtomicUsize::new(0));
    let finished_clone = Arc::clone(&finished);

    let result = orchestrator
        .process_in_batches(
            (0..20).collect(),
            &options(10, 10).continue_on_error(false),
            move |n: u64, _| {
                let finished = Arc::clone(&finished_clone);
                async move {
                    if n == 0 {
                        return Err(FetchError::permanent("first item fails", Some(422)));
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(n)
                }
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(FetchError::PermanentUpstream { .. })));
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let orchestrator = BulkOrchestrator::default();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (active_clone, peak_clone) = (Arc::clone(&active), Arc::clone(&peak));
    let outcome = orchestrator
        .process_in_batches(
            (0..12).collect(),
            &options(12, 3),
            move |n: u32, _| {
                let active = Arc::clone(&active_clone);
                let peak = Arc::clone(&peak_clone);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.completed_items, 12);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    // Four waves of three.
    assert_eq!(outcome.elapsed, Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn test_progress_estimates_remaining_time() {
    let orchestrator = BulkOrchestrator::default();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<BatchProgress>();

    orchestrator
        .process_in_batches(
            (0..4).collect(),
            &options(10, 1),
            |n: u32, _| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(n)
            },
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    drop(tx);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.completed_items, 1);
    assert_eq!(first.elapsed, Duration::from_secs(1));
    assert_eq!(first.estimated_remaining, Duration::from_secs(3));

    let second = rx.recv().await.unwrap();
    assert_eq!(second.estimated_remaining, Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation() {
    let orchestrator = BulkOrchestrator::default();
    let cancel = CancellationToken::new();
    let saw_cancel = Arc::new(AtomicUsize::new(0));

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        })
    };

    let saw_cancel_clone = Arc::clone(&saw_cancel);
    let result = orchestrator
        .process_in_batches(
            (0..8).collect(),
            &options(4, 2),
            move |n: u32, token: CancellationToken| {
                let saw_cancel = Arc::clone(&saw_cancel_clone);
                async move {
                    tokio::select! {
                        () = token.cancelled() => {
                            saw_cancel.fetch_add(1, Ordering::SeqCst);
                            Err(FetchError::cancelled("item cancelled"))
                        }
                        () = tokio::time::sleep(Duration::from_secs(10)) => Ok(n),
                    }
                }
            },
            &NoProgress,
            &cancel,
        )
        .await;
    canceller.await.unwrap();

    assert!(matches!(result, Err(FetchError::Cancelled { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_batches_mode_reports_per_batch() {
    let orchestrator = BulkOrchestrator::default();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<BatchProgress>();

    let outcome = orchestrator
        .process_in_batches(
            (0..25).collect(),
            &options(10, 2).dispatch(DispatchMode::Batches),
            |n: u32, _| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(n)
            },
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    drop(tx);

    assert_eq!(outcome.completed_items, 25);
    let mut snapshots = Vec::new();
    while let Some(progress) = rx.recv().await {
        snapshots.push(progress.completed_items);
    }
    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots.last(), Some(&25));
}

#[tokio::test]
async fn test_zero_batch_size_rejected() {
    let orchestrator = BulkOrchestrator::default();

    let result = orchestrator
        .process_in_batches(
            vec![1u32],
            &options(0, 1),
            |n, _| async move { Ok(n) },
            &NoProgress,
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(FetchError::Configuration { .. })));
}
