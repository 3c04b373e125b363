//! Bounded-concurrency bulk processing.
//!
//! Items are split into batches of `batch_size`. In [`DispatchMode::Items`]
//! batches run one after another and the items of a batch run concurrently,
//! at most `max_concurrency` at a time. In [`DispatchMode::Batches`] up to
//! `max_concurrency` batches run at once and each processes its items in
//! order. The worker bound is a semaphore owned by the call and is unrelated
//! to the upstream rate limit.

mod progress;

pub use progress::{
    estimate_remaining, BatchProgress, BulkOutcome, NoProgress, ProgressObserver,
};

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::{FetchError, FetchResult};
use progress::BatchJob;

/// How work is spread over the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One worker per item; batches run in sequence.
    #[default]
    Items,
    /// One worker per batch; items inside a batch run in sequence.
    Batches,
}

/// Bulk processing defaults.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Items per batch.
    pub batch_size: usize,
    /// Maximum concurrent workers.
    pub max_concurrency: usize,
    /// Record failures and keep going instead of aborting.
    pub continue_on_error: bool,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrency: 4,
            continue_on_error: true,
        }
    }
}

impl BulkConfig {
    /// Creates a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the worker bound.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Sets the failure mode.
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }
}

/// Options for one bulk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOptions {
    /// Items per batch.
    pub batch_size: usize,
    /// Maximum concurrent workers.
    pub max_concurrency: usize,
    /// Record failures and keep going instead of aborting.
    pub continue_on_error: bool,
    /// Work distribution.
    pub dispatch: DispatchMode,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self::from(&BulkConfig::default())
    }
}

impl From<&BulkConfig> for BulkOptions {
    fn from(config: &BulkConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_concurrency: config.max_concurrency,
            continue_on_error: config.continue_on_error,
            dispatch: DispatchMode::Items,
        }
    }
}

impl BulkOptions {
    /// Sets the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the worker bound.
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Sets the failure mode.
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Sets the dispatch mode.
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Validates the options.
    pub fn validate(&self) -> FetchResult<()> {
        if self.batch_size == 0 {
            return Err(FetchError::configuration("batch_size must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(FetchError::configuration(
                "max_concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Sizes of the batches `total` items split into.
pub fn batch_sizes(total: usize, batch_size: usize) -> Vec<usize> {
    if batch_size == 0 {
        return Vec::new();
    }
    (0..total)
        .step_by(batch_size)
        .map(|start| batch_size.min(total - start))
        .collect()
}

fn into_batches<I>(items: Vec<I>, batch_size: usize) -> Vec<Vec<(usize, I)>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);
    for (index, item) in items.into_iter().enumerate() {
        current.push((index, item));
        if current.len() == batch_size {
            batches.push(std::mem::replace(
                &mut current,
                Vec::with_capacity(batch_size),
            ));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Runs many units of work under a concurrency bound.
#[derive(Debug, Clone, Default)]
pub struct BulkOrchestrator {
    config: BulkConfig,
}

impl BulkOrchestrator {
    /// Creates a new orchestrator.
    pub fn new(config: BulkConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Returns per-call options seeded from the configuration.
    pub fn options(&self) -> BulkOptions {
        BulkOptions::from(&self.config)
    }

    /// Processes `items` with `processor`.
    ///
    /// `processor` receives each item together with a token that is cancelled
    /// when the call is aborted, either by `cancel` or by a fail-fast error.
    /// With `continue_on_error` every item is attempted and failures are
    /// collected as [`FetchError::BatchItem`]; otherwise the first failure is
    /// returned and outstanding work is dropped.
    #[instrument(skip_all, fields(total = items.len(), batch_size = options.batch_size, dispatch = ?options.dispatch))]
    pub async fn process_in_batches<I, O, F, Fut>(
        &self,
        items: Vec<I>,
        options: &BulkOptions,
        processor: F,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> FetchResult<BulkOutcome<O>>
    where
        F: Fn(I, CancellationToken) -> Fut,
        Fut: Future<Output = FetchResult<O>>,
    {
        options.validate()?;

        let job = BatchJob::new(items.len(), options.continue_on_error);
        let job_id = job.id;
        let job_token = cancel.child_token();
        let batches = into_batches(items, options.batch_size);
        tracing::info!(%job_id, batches = batches.len(), "Bulk job started");

        let run = async {
            match options.dispatch {
                DispatchMode::Items => {
                    run_items(job, batches, options, &processor, observer, &job_token).await
                }
                DispatchMode::Batches => {
                    run_batches(job, batches, options, &processor, observer, &job_token).await
                }
            }
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::cancelled("bulk job cancelled")),
            result = run => result,
        };

        match result {
            Ok(job) => {
                let outcome = job.finish();
                tracing::info!(
                    %job_id,
                    completed = outcome.completed_items,
                    failed = outcome.failed_items,
                    elapsed_ms = outcome.elapsed.as_millis(),
                    "Bulk job finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                job_token.cancel();
                tracing::warn!(%job_id, error = %err, "Bulk job aborted");
                Err(err)
            }
        }
    }
}

async fn run_items<I, O, F, Fut>(
    mut job: BatchJob<O>,
    batches: Vec<Vec<(usize, I)>>,
    options: &BulkOptions,
    processor: &F,
    observer: &dyn ProgressObserver,
    token: &CancellationToken,
) -> FetchResult<BatchJob<O>>
where
    F: Fn(I, CancellationToken) -> Fut,
    Fut: Future<Output = FetchResult<O>>,
{
    let semaphore = Semaphore::new(options.max_concurrency);

    for batch in batches {
        let mut pending: FuturesUnordered<_> = batch
            .into_iter()
            .map(|(index, item)| {
                let semaphore = &semaphore;
                let work = processor(item, token.clone());
                async move {
                    let result = match semaphore.acquire().await {
                        Ok(_permit) => work.await,
                        Err(_) => Err(FetchError::cancelled("worker pool closed")),
                    };
                    (index, result)
                }
            })
            .collect();

        while let Some((index, result)) = pending.next().await {
            job.record(index, result)?;
            observer.on_progress(&job.progress());
        }
    }
    Ok(job)
}

async fn run_batches<I, O, F, Fut>(
    mut job: BatchJob<O>,
    batches: Vec<Vec<(usize, I)>>,
    options: &BulkOptions,
    processor: &F,
    observer: &dyn ProgressObserver,
    token: &CancellationToken,
) -> FetchResult<BatchJob<O>>
where
    F: Fn(I, CancellationToken) -> Fut,
    Fut: Future<Output = FetchResult<O>>,
{
    let semaphore = Semaphore::new(options.max_concurrency);
    let stop_on_error = !options.continue_on_error;

    let mut pending: FuturesUnordered<_> = batches
        .into_iter()
        .map(|batch| {
            let semaphore = &semaphore;
            async move {
                let mut results = Vec::with_capacity(batch.len());
                let Ok(_permit) = semaphore.acquire().await else {
                    return results;
                };
                for (index, item) in batch {
                    let result = processor(item, token.clone()).await;
                    let failed = result.is_err();
                    results.push((index, result));
                    if failed && stop_on_error {
                        break;
                    }
                }
                results
            }
        })
        .collect();

    while let Some(results) = pending.next().await {
        for (index, result) in results {
            job.record(index, result)?;
        }
        observer.on_progress(&job.progress());
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_sizes() {
        assert_eq!(batch_sizes(25, 10), vec![10, 10, 5]);
        assert_eq!(batch_sizes(20, 10), vec![10, 10]);
        assert_eq!(batch_sizes(3, 10), vec![3]);
        assert!(batch_sizes(0, 10).is_empty());
    }

    #[test]
    fn test_into_batches_keeps_indices() {
        let batches = into_batches(vec!['a', 'b', 'c', 'd', 'e'], 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![(4, 'e')]);
        assert_eq!(batches[1], vec![(2, 'c'), (3, 'd')]);
    }

    #[test]
    fn test_options_from_config() {
        let options = BulkOptions::from(&BulkConfig::new().batch_size(5).continue_on_error(false));
        assert_eq!(options.batch_size, 5);
        assert_eq!(options.max_concurrency, 4);
        assert!(!options.continue_on_error);
        assert_eq!(options.dispatch, DispatchMode::Items);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let orchestrator = BulkOrchestrator::default();
        let options = orchestrator.options().max_concurrency(0);

        let result = orchestrator
            .process_in_batches(
                vec![1, 2, 3],
                &options,
                |n: u32, _| async move { Ok(n) },
                &NoProgress,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(FetchError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let orchestrator = BulkOrchestrator::default();

        let outcome = orchestrator
            .process_in_batches(
                Vec::<u32>::new(),
                &orchestrator.options(),
                |n, _| async move { Ok(n) },
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.total_items, 0);
        assert!(outcome.results.is_empty());
        assert!(outcome.is_success());
    }
}
