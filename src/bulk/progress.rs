//! Bulk job progress tracking.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::{FetchError, FetchResult};

/// Progress snapshot emitted after each item or batch completes.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    /// Job identifier.
    pub job_id: Uuid,
    /// Items submitted.
    pub total_items: usize,
    /// Items that succeeded.
    pub completed_items: usize,
    /// Items that failed.
    pub failed_items: usize,
    /// Failure messages, in the order failures were observed.
    pub error_messages: Vec<String>,
    /// True once every item has been processed.
    pub is_completed: bool,
    /// Time since the job started.
    pub elapsed: Duration,
    /// Projected time until the job finishes.
    pub estimated_remaining: Duration,
}

impl BatchProgress {
    /// Items processed so far, successful or not.
    pub fn processed_items(&self) -> usize {
        self.completed_items + self.failed_items
    }

    /// Fraction of items processed, in `0.0..=1.0`.
    pub fn fraction_done(&self) -> f64 {
        if self.total_items == 0 {
            1.0
        } else {
            self.processed_items() as f64 / self.total_items as f64
        }
    }
}

/// Receives progress snapshots from a bulk job.
pub trait ProgressObserver: Send + Sync {
    /// Called after each item (or batch) completes.
    fn on_progress(&self, progress: &BatchProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&BatchProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &BatchProgress) {
        self(progress);
    }
}

impl ProgressObserver for UnboundedSender<BatchProgress> {
    fn on_progress(&self, progress: &BatchProgress) {
        // A closed receiver just means nobody is watching any more.
        let _ = self.send(progress.clone());
    }
}

/// Observer that ignores progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _progress: &BatchProgress) {}
}

/// Mutable state of one bulk call.
#[derive(Debug)]
pub(crate) struct BatchJob<O> {
    pub(crate) id: Uuid,
    pub(crate) started_at: DateTime<Utc>,
    started: Instant,
    total: usize,
    completed: usize,
    failed: usize,
    error_messages: Vec<String>,
    errors: Vec<FetchError>,
    results: Vec<O>,
    continue_on_error: bool,
}

impl<O> BatchJob<O> {
    pub(crate) fn new(total: usize, continue_on_error: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            total,
            completed: 0,
            failed: 0,
            error_messages: Vec::new(),
            errors: Vec::new(),
            results: Vec::with_capacity(total),
            continue_on_error,
        }
    }

    /// Folds one item result into the job.
    ///
    /// In fail-fast mode the first failure is handed back to the caller.
    pub(crate) fn record(&mut self, index: usize, result: FetchResult<O>) -> FetchResult<()> {
        match result {
            Ok(value) => {
                self.completed += 1;
                self.results.push(value);
                Ok(())
            }
            Err(err) if self.continue_on_error => {
                let item_error = FetchError::BatchItem {
                    index,
                    message: err.to_string(),
                };
                tracing::warn!(job_id = %self.id, index, error = %err, "Bulk item failed");
                self.failed += 1;
                self.error_messages.push(item_error.to_string());
                self.errors.push(item_error);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn progress(&self) -> BatchProgress {
        let elapsed = self.started.elapsed();
        let is_completed = self.completed + self.failed >= self.total;
        let estimated_remaining = if is_completed {
            Duration::ZERO
        } else {
            estimate_remaining(elapsed, self.completed, self.total)
        };
        BatchProgress {
            job_id: self.id,
            total_items: self.total,
            completed_items: self.completed,
            failed_items: self.failed,
            error_messages: self.error_messages.clone(),
            is_completed,
            elapsed,
            estimated_remaining,
        }
    }

    pub(crate) fn finish(self) -> BulkOutcome<O> {
        BulkOutcome {
            job_id: self.id,
            started_at: self.started_at,
            elapsed: self.started.elapsed(),
            total_items: self.total,
            completed_items: self.completed,
            failed_items: self.failed,
            results: self.results,
            errors: self.errors,
        }
    }
}

/// Time left, projected from the average time per completed item.
///
/// Zero when nothing has completed yet or everything has.
pub fn estimate_remaining(elapsed: Duration, completed: usize, total: usize) -> Duration {
    if completed == 0 || completed >= total {
        return Duration::ZERO;
    }
    let remaining = (total - completed) as f64;
    elapsed.mul_f64(remaining / completed as f64)
}

/// Final result of a bulk call.
#[derive(Debug)]
pub struct BulkOutcome<O> {
    /// Job identifier, matching the emitted progress snapshots.
    pub job_id: Uuid,
    /// Wall-clock start of the job.
    pub started_at: DateTime<Utc>,
    /// Total run time.
    pub elapsed: Duration,
    /// Items submitted.
    pub total_items: usize,
    /// Items that succeeded.
    pub completed_items: usize,
    /// Items that failed.
    pub failed_items: usize,
    /// Successful outputs, in completion order.
    pub results: Vec<O>,
    /// One [`FetchError::BatchItem`] per failed item.
    pub errors: Vec<FetchError>,
}

impl<O> BulkOutcome<O> {
    /// Returns true if no item failed.
    pub fn is_success(&self) -> bool {
        self.failed_items == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(
            estimate_remaining(Duration::from_secs(10), 5, 20),
            Duration::from_secs(30)
        );
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0, 20), Duration::ZERO);
        assert_eq!(estimate_remaining(Duration::from_secs(10), 20, 20), Duration::ZERO);
    }

    #[test]
    fn test_record_continue_on_error() {
        let mut job = BatchJob::<u32>::new(3, true);
        job.record(0, Ok(1)).unwrap();
        job.record(1, Err(FetchError::permanent("not found", Some(404))))
            .unwrap();
        job.record(2, Ok(3)).unwrap();

        let progress = job.progress();
        assert_eq!(progress.completed_items, 2);
        assert_eq!(progress.failed_items, 1);
        assert!(progress.is_completed);
        assert_eq!(progress.error_messages.len(), 1);
        assert!(progress.error_messages[0].starts_with("Batch item 1 failed"));

        let outcome = job.finish();
        assert_eq!(outcome.results, vec![1, 3]);
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_record_fail_fast_returns_error() {
        let mut job = BatchJob::<u32>::new(2, false);
        let result = job.record(0, Err(FetchError::permanent("boom", None)));
        assert!(matches!(result, Err(FetchError::PermanentUpstream { .. })));
    }

    #[tokio::test]
    async fn test_channel_observer() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<BatchProgress>();
        let job = BatchJob::<u32>::new(1, true);

        tx.on_progress(&job.progress());

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.job_id, job.id);
        assert!((progress.fraction_done() - 0.0).abs() < f64::EPSILON);
    }
}
