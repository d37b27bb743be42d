//! Entry point for callers that create and cancel jobs.

use std::sync::Arc;

use garde::Validate;
use uuid::Uuid;

use crate::models::job::{JobMetadata, JobParams, JobResult, JobStatus};
use crate::services::queue::{JobQueue, QueueError, QueueMessage};
use crate::services::store::{JobStore, StoreError};
use crate::services::worker_pool::CancellationRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid job parameters: {0}")]
    Validation(String),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<garde::Report> for ServiceError {
    fn from(report: garde::Report) -> Self {
        ServiceError::Validation(report.to_string())
    }
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    cancellations: Arc<CancellationRegistry>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            cancellations,
        }
    }

    /// Create a pending job and enqueue it.
    pub async fn submit(&self, params: JobParams, user_id: Option<&str>) -> Result<Uuid, ServiceError> {
        params.validate()?;
        let job_type = params.job_type();
        let job_id = self
            .store
            .create_job(job_type, &JobMetadata::new(params.clone()), user_id)
            .await?;

        let message = QueueMessage {
            job_id,
            job_type,
            params,
            user_id: user_id.map(str::to_string),
        };
        if let Err(e) = self.queue.enqueue(&message).await {
            tracing::error!(job_id = %job_id, error = %e, "Enqueue failed, failing job");
            let failure = JobResult::failure(format!("Failed to enqueue job: {e}"));
            if let Err(store_error) = self.store.save_job_result(job_id, &failure).await {
                tracing::error!(job_id = %job_id, error = %store_error, "Could not mark job failed");
            }
            return Err(e.into());
        }

        metrics::counter!("jobs_submitted_total", "job_type" => job_type.to_string()).increment(1);
        tracing::info!(job_id = %job_id, job_type = %job_type, "Job submitted");
        Ok(job_id)
    }

    /// Cancel a job. Returns false if it had already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, ServiceError> {
        let applied = self
            .store
            .update_job_status(job_id, JobStatus::Cancelled, None)
            .await?;
        if !applied {
            return match self.store.get_job(job_id).await? {
                Some(_) => Ok(false),
                None => Err(ServiceError::NotFound(job_id)),
            };
        }

        if self.cancellations.cancel(job_id).await {
            tracing::debug!(job_id = %job_id, "Tripped in-process cancellation token");
        }
        if let Err(e) = self.queue.remove_job(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Could not remove cancelled job from queue");
        }
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(true)
    }
}
