//! Shared "fetch → resume → iterate batches → finalize" algorithm.
//!
//! Job types plug in through [`BatchHandler`]; [`BatchProcessor`] owns the
//! lifecycle: status transitions, checkpointing after every batch,
//! cancellation checks at batch boundaries and the terminal result write.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::checkpoint::Checkpoint;
use crate::models::job::{JobCounters, JobParams, JobResult, JobStatus, JobType, MetadataPatch};
use crate::services::checkpoint::{CheckpointError, CheckpointManager};
use crate::services::generator::GeneratorError;
use crate::services::scraper::ScrapeError;
use crate::services::store::{JobStore, StoreError};
use crate::services::verifier::VerifierError;

/// Number of most recent items kept in the metadata preview.
pub const PREVIEW_LIMIT: usize = 20;

/// Running progress never reports completion; only the terminal write does.
const MAX_RUNNING_PROGRESS: u8 = 99;

/// Output of one batch.
#[derive(Debug)]
pub struct BatchOutput<T> {
    pub items: Vec<T>,
    /// Whether the batch called a third-party service (enables the courtesy delay).
    pub touched_network: bool,
    /// Set when the batch produced placeholder output for a failed operation.
    pub failure: Option<String>,
}

impl<T> BatchOutput<T> {
    pub fn local(items: Vec<T>) -> Self {
        Self {
            items,
            touched_network: false,
            failure: None,
        }
    }

    pub fn remote(items: Vec<T>) -> Self {
        Self {
            items,
            touched_network: true,
            failure: None,
        }
    }

    pub fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }
}

/// Final `data` and `stats` of a completed job.
#[derive(Debug)]
pub struct Aggregate {
    pub data: serde_json::Value,
    pub stats: serde_json::Value,
}

/// Batch-local failure. Absorbed by the processor; never fails the job.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Verifier(#[from] VerifierError),

    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

/// Structural failure of a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} has no metadata")]
    MissingMetadata(Uuid),

    #[error("Job parameters are for {found}, handler expects {expected}")]
    ParamsMismatch { expected: JobType, found: JobType },

    #[error("No handler registered for job type {0}")]
    UnknownJobType(JobType),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Invariant(String),
}

impl JobError {
    /// Whether redelivering the message could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Store(StoreError::Database(_))
                | JobError::Checkpoint(CheckpointError::Store(StoreError::Database(_)))
        )
    }
}

/// How a run ended, when it did not end with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { processed: usize },
    /// Cancellation observed; nothing terminal was written by this run.
    Cancelled { cursor: usize },
    /// Worker shutdown observed; the job stays `running` and resumes on redelivery.
    Interrupted { cursor: usize },
    /// The job was already terminal when the message arrived.
    Skipped { status: JobStatus },
    /// The job was marked failed with this error.
    Failed { error: String },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Cancelled { .. } => "cancelled",
            RunOutcome::Interrupted { .. } => "interrupted",
            RunOutcome::Skipped { .. } => "skipped",
            RunOutcome::Failed { .. } => "failed",
        }
    }
}

/// Per-execution context handed to a runner.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: JobType,
    /// Tripped on user cancellation or worker shutdown.
    pub cancel: CancellationToken,
    /// Tripped only on worker shutdown.
    pub shutdown: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: Uuid, job_type: JobType, shutdown: &CancellationToken) -> Self {
        Self {
            job_id,
            job_type,
            cancel: shutdown.child_token(),
            shutdown: shutdown.clone(),
        }
    }

    /// Context not tied to any worker pool.
    pub fn detached(job_id: Uuid, job_type: JobType) -> Self {
        Self::new(job_id, job_type, &CancellationToken::new())
    }
}

/// Why the loop stopped at a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Interrupted,
    Terminal(JobStatus),
}

/// Cooperative cancellation check used at batch boundaries.
pub struct CancellationGuard<'a> {
    store: &'a dyn JobStore,
    ctx: &'a JobContext,
}

impl<'a> CancellationGuard<'a> {
    pub fn new(store: &'a dyn JobStore, ctx: &'a JobContext) -> Self {
        Self { store, ctx }
    }

    /// `None` to continue, otherwise the reason to stop.
    pub async fn check(&self) -> Result<Option<StopReason>, JobError> {
        let job = self
            .store
            .get_job(self.ctx.job_id)
            .await?
            .ok_or(JobError::NotFound(self.ctx.job_id))?;

        match job.status {
            JobStatus::Cancelled => return Ok(Some(StopReason::Cancelled)),
            status if status.is_terminal() => return Ok(Some(StopReason::Terminal(status))),
            _ => {}
        }

        if self.ctx.shutdown.is_cancelled() {
            return Ok(Some(StopReason::Interrupted));
        }
        if self.ctx.cancel.is_cancelled() {
            // Token tripped without a stored cancellation: record it ourselves.
            self.store
                .update_job_status(self.ctx.job_id, JobStatus::Cancelled, None)
                .await?;
            return Ok(Some(StopReason::Cancelled));
        }
        Ok(None)
    }

    /// Sleep for `delay` unless cancelled first.
    pub async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.ctx.cancel.cancelled() => {}
        }
    }
}

/// One job type's contribution to the shared loop.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    type Params: Send + Sync + 'static;
    type Item: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn job_type(&self) -> JobType;

    fn batch_size(&self) -> usize;

    /// Pause between batches that called a third-party service.
    fn courtesy_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn params<'p>(&self, params: &'p JobParams) -> Option<&'p Self::Params>;

    fn total_units(&self, params: &Self::Params) -> usize;

    async fn process_batch(
        &self,
        params: &Self::Params,
        units: Range<usize>,
    ) -> Result<BatchOutput<Self::Item>, BatchError>;

    /// Placeholder items recorded for a batch that failed outright.
    fn recover_batch(
        &self,
        _params: &Self::Params,
        _units: Range<usize>,
        _error: &BatchError,
    ) -> Vec<Self::Item> {
        Vec::new()
    }

    /// `(succeeded, failed)` counts for a batch's items.
    fn tally(&self, items: &[Self::Item]) -> (usize, usize) {
        (items.len(), 0)
    }

    fn aggregate(&self, params: &Self::Params, items: Vec<Self::Item>) -> Result<Aggregate, JobError>;
}

/// Type-erased entry point used by the worker pool.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, ctx: &JobContext) -> Result<RunOutcome, JobError>;
}

pub struct BatchProcessor<H: BatchHandler> {
    handler: H,
    store: Arc<dyn JobStore>,
    checkpoints: CheckpointManager,
}

impl<H: BatchHandler> BatchProcessor<H> {
    pub fn new(handler: H, store: Arc<dyn JobStore>) -> Self {
        let checkpoints = CheckpointManager::new(store.clone());
        Self {
            handler,
            store,
            checkpoints,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Run a job to a terminal state or to the next stop boundary.
    pub async fn process(&self, ctx: &JobContext) -> Result<RunOutcome, JobError> {
        let job_id = ctx.job_id;
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        if job.status.is_terminal() {
            tracing::info!(job_id = %job_id, status = %job.status, "Job already finished, skipping");
            return Ok(RunOutcome::Skipped { status: job.status });
        }

        if !self
            .store
            .update_job_status(job_id, JobStatus::Running, None)
            .await?
        {
            return self.left_running(job_id, 0).await;
        }

        metrics::counter!("jobs_started_total", "job_type" => ctx.job_type.to_string())
            .increment(1);
        tracing::info!(job_id = %job_id, job_type = %ctx.job_type, "Job running");

        match self.execute(ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.fail_job(job_id, e).await,
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<RunOutcome, JobError> {
        let job_id = ctx.job_id;
        let job = self
            .store
            .get_job_with_metadata(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        let metadata = job.metadata.ok_or(JobError::MissingMetadata(job_id))?;

        let params = self
            .handler
            .params(&metadata.params)
            .ok_or(JobError::ParamsMismatch {
                expected: self.handler.job_type(),
                found: metadata.params.job_type(),
            })?;
        let total = self.handler.total_units(params);

        let mut checkpoint: Checkpoint<H::Item> = self
            .checkpoints
            .resume(self.handler.job_type(), metadata.checkpoint.as_ref())?;
        if checkpoint.cursor > total {
            return Err(JobError::Invariant(format!(
                "checkpoint cursor {} is past the {} units of the job",
                checkpoint.cursor, total
            )));
        }
        if checkpoint.cursor > 0 {
            tracing::info!(
                job_id = %job_id,
                cursor = checkpoint.cursor,
                total,
                "Resuming from checkpoint"
            );
        }

        let guard = CancellationGuard::new(self.store.as_ref(), ctx);
        let batch_size = self.handler.batch_size().max(1);
        let job_type = ctx.job_type.to_string();

        while checkpoint.cursor < total {
            if let Some(reason) = guard.check().await? {
                return Ok(self.stopped(job_id, reason, checkpoint.cursor));
            }

            let units = checkpoint.cursor..(checkpoint.cursor + batch_size).min(total);
            let batch = checkpoint.batches_completed + checkpoint.failed_batches;
            let started = Instant::now();

            let (items, touched_network, failure) =
                match self.handler.process_batch(params, units.clone()).await {
                    Ok(output) => (output.items, output.touched_network, output.failure),
                    Err(e) => {
                        let items = self.handler.recover_batch(params, units.clone(), &e);
                        (items, true, Some(e.to_string()))
                    }
                };

            metrics::histogram!("job_batch_duration_seconds", "job_type" => job_type.clone())
                .record(started.elapsed().as_secs_f64());

            match &failure {
                Some(error) => {
                    tracing::warn!(
                        job_id = %job_id,
                        batch,
                        units = ?units,
                        error = %error,
                        "Batch failed, continuing"
                    );
                    checkpoint.failed_batches += 1;
                    metrics::counter!("job_batches_total", "job_type" => job_type.clone(), "result" => "failed")
                        .increment(1);
                }
                None => {
                    checkpoint.batches_completed += 1;
                    metrics::counter!("job_batches_total", "job_type" => job_type.clone(), "result" => "ok")
                        .increment(1);
                }
            }

            let (succeeded, failed) = self.handler.tally(&items);
            let previous = checkpoint.mark();
            checkpoint.succeeded += succeeded;
            checkpoint.failed += failed;
            checkpoint.accumulator.extend(items);
            checkpoint.cursor = units.end;

            let percent = ((checkpoint.cursor * 100) / total) as u8;
            let patch = MetadataPatch {
                counters: JobCounters {
                    total_items: total,
                    processed_items: checkpoint.cursor,
                    success_count: checkpoint.succeeded,
                    failure_count: checkpoint.failed,
                    failed_batches: checkpoint.failed_batches,
                },
                preview: preview(&checkpoint.accumulator),
            };
            if !self
                .store
                .update_job_progress(job_id, percent.min(MAX_RUNNING_PROGRESS), &patch)
                .await?
            {
                return self.left_running(job_id, checkpoint.cursor).await;
            }
            if !self.checkpoints.save(job_id, previous, &mut checkpoint).await? {
                return self.left_running(job_id, checkpoint.cursor).await;
            }

            tracing::debug!(
                job_id = %job_id,
                batch,
                processed = checkpoint.cursor,
                total,
                "Batch done"
            );

            let delay = self.handler.courtesy_delay();
            if touched_network && checkpoint.cursor < total && !delay.is_zero() {
                guard.pause(delay).await;
            }
        }

        let processed = checkpoint.cursor;
        let aggregate = self.handler.aggregate(params, checkpoint.accumulator)?;
        let result = JobResult::success(aggregate.data, aggregate.stats);
        if !self.store.save_job_result(job_id, &result).await? {
            return self.left_running(job_id, processed).await;
        }

        metrics::counter!("jobs_finished_total", "job_type" => job_type, "outcome" => "completed")
            .increment(1);
        tracing::info!(job_id = %job_id, processed, "Job completed");
        Ok(RunOutcome::Completed { processed })
    }

    fn stopped(&self, job_id: Uuid, reason: StopReason, cursor: usize) -> RunOutcome {
        match reason {
            StopReason::Cancelled => {
                metrics::counter!("jobs_finished_total", "job_type" => self.handler.job_type().to_string(), "outcome" => "cancelled")
                    .increment(1);
                tracing::info!(job_id = %job_id, cursor, "Job cancelled");
                RunOutcome::Cancelled { cursor }
            }
            StopReason::Interrupted => {
                tracing::info!(job_id = %job_id, cursor, "Job interrupted by shutdown");
                RunOutcome::Interrupted { cursor }
            }
            StopReason::Terminal(status) => RunOutcome::Skipped { status },
        }
    }

    /// A guarded write was refused: find out what the job became.
    async fn left_running(&self, job_id: Uuid, cursor: usize) -> Result<RunOutcome, JobError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        match job.status {
            JobStatus::Cancelled => Ok(self.stopped(job_id, StopReason::Cancelled, cursor)),
            status if status.is_terminal() => Ok(RunOutcome::Skipped { status }),
            status => Err(JobError::Invariant(format!(
                "job store refused a write while the job was {status}"
            ))),
        }
    }

    async fn fail_job(&self, job_id: Uuid, error: JobError) -> Result<RunOutcome, JobError> {
        let message = error.to_string();
        tracing::error!(job_id = %job_id, error = %message, "Job failed");

        match self
            .store
            .save_job_result(job_id, &JobResult::failure(message.clone()))
            .await
        {
            Ok(true) => {
                metrics::counter!("jobs_finished_total", "job_type" => self.handler.job_type().to_string(), "outcome" => "failed")
                    .increment(1);
                Ok(RunOutcome::Failed { error: message })
            }
            Ok(false) => match self.store.get_job(job_id).await {
                Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                    Ok(RunOutcome::Cancelled { cursor: 0 })
                }
                Ok(Some(job)) if job.status.is_terminal() => {
                    Ok(RunOutcome::Skipped { status: job.status })
                }
                _ => Err(error),
            },
            Err(store_error) => {
                tracing::error!(
                    job_id = %job_id,
                    error = %store_error,
                    "Could not record job failure"
                );
                Err(JobError::Store(store_error))
            }
        }
    }
}

fn preview<T: Serialize>(items: &[T]) -> Vec<serde_json::Value> {
    let start = items.len().saturating_sub(PREVIEW_LIMIT);
    items[start..]
        .iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect()
}

#[async_trait]
impl<H: BatchHandler> JobRunner for BatchProcessor<H> {
    fn job_type(&self) -> JobType {
        self.handler.job_type()
    }

    async fn run(&self, ctx: &JobContext) -> Result<RunOutcome, JobError> {
        self.process(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{GenerateParams, JobMetadata};
    use crate::services::store::MemoryJobStore;

    /// Emits `unit` for every unit; fails the batch starting at `fail_at`.
    struct Counting {
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl BatchHandler for Counting {
        type Params = GenerateParams;
        type Item = usize;

        fn job_type(&self) -> JobType {
            JobType::Generate
        }

        fn batch_size(&self) -> usize {
            10
        }

        fn params<'p>(&self, params: &'p JobParams) -> Option<&'p GenerateParams> {
            match params {
                JobParams::Generate(p) => Some(p),
                _ => None,
            }
        }

        fn total_units(&self, params: &GenerateParams) -> usize {
            params.count
        }

        async fn process_batch(
            &self,
            _params: &GenerateParams,
            units: Range<usize>,
        ) -> Result<BatchOutput<usize>, BatchError> {
            if Some(units.start) == self.fail_at {
                return Err(GeneratorError::Engine("engine offline".into()).into());
            }
            Ok(BatchOutput::local(units.collect()))
        }

        fn aggregate(&self, _params: &GenerateParams, items: Vec<usize>) -> Result<Aggregate, JobError> {
            Ok(Aggregate {
                stats: serde_json::json!({ "count": items.len() }),
                data: serde_json::json!(items),
            })
        }
    }

    async fn job(store: &MemoryJobStore, count: usize) -> Uuid {
        let metadata = JobMetadata::new(JobParams::Generate(GenerateParams {
            count,
            domains: vec!["example.com".to_string()],
            patterns: vec![],
            first_names: vec![],
            last_names: vec![],
            birth_years: None,
        }));
        store.create_job(JobType::Generate, &metadata, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_runs_all_batches_and_completes() {
        let store = Arc::new(MemoryJobStore::new());
        let id = job(&store, 25).await;
        let processor = BatchProcessor::new(Counting { fail_at: None }, store.clone());

        let outcome = processor.process(&JobContext::detached(id, JobType::Generate)).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { processed: 25 });

        let job = store.snapshot(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        let result = job.result_data.unwrap();
        assert_eq!(result["stats"]["count"], 25);

        let metadata = job.metadata.unwrap();
        assert_eq!(metadata.preview.len(), PREVIEW_LIMIT);
        assert_eq!(metadata.preview.last(), Some(&serde_json::json!(24)));
        assert_eq!(metadata.counters.processed_items, 25);
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_job() {
        let store = Arc::new(MemoryJobStore::new());
        let id = job(&store, 30).await;
        let processor = BatchProcessor::new(Counting { fail_at: Some(10) }, store.clone());

        let outcome = processor.process(&JobContext::detached(id, JobType::Generate)).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { processed: 30 });

        let job = store.snapshot(id).await.unwrap();
        assert_eq!(job.metadata.unwrap().counters.failed_batches, 1);
        assert_eq!(job.result_data.unwrap()["stats"]["count"], 20);
    }

    #[tokio::test]
    async fn test_terminal_job_is_skipped() {
        let store = Arc::new(MemoryJobStore::new());
        let id = job(&store, 5).await;
        store.update_job_status(id, JobStatus::Cancelled, None).await.unwrap();
        let processor = BatchProcessor::new(Counting { fail_at: None }, store.clone());

        let outcome = processor.process(&JobContext::detached(id, JobType::Generate)).await.unwrap();
        assert_eq!(outcome, RunOutcome::Skipped { status: JobStatus::Cancelled });
    }

    #[tokio::test]
    async fn test_missing_job_is_not_retryable() {
        let store = Arc::new(MemoryJobStore::new());
        let processor = BatchProcessor::new(Counting { fail_at: None }, store);
        let err = processor
            .process(&JobContext::detached(Uuid::new_v4(), JobType::Generate))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_tripped_token_cancels_at_boundary() {
        let store = Arc::new(MemoryJobStore::new());
        let id = job(&store, 20).await;
        let processor = BatchProcessor::new(Counting { fail_at: None }, store.clone());

        let ctx = JobContext::detached(id, JobType::Generate);
        ctx.cancel.cancel();
        let outcome = processor.process(&ctx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled { cursor: 0 });
        assert_eq!(store.snapshot(id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_job_running() {
        let store = Arc::new(MemoryJobStore::new());
        let id = job(&store, 20).await;
        let processor = BatchProcessor::new(Counting { fail_at: None }, store.clone());

        let shutdown = CancellationToken::new();
        let ctx = JobContext::new(id, JobType::Generate, &shutdown);
        shutdown.cancel();
        let outcome = processor.process(&ctx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted { cursor: 0 });
        assert_eq!(store.snapshot(id).await.unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_preview_keeps_latest_items() {
        let items: Vec<usize> = (0..50).collect();
        let preview = preview(&items);
        assert_eq!(preview.len(), PREVIEW_LIMIT);
        assert_eq!(preview[0], serde_json::json!(30));
    }
}
