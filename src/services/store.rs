//! Job store boundary.
//!
//! The batch processor only talks to jobs through [`JobStore`]. Postgres
//! provides the production implementation (`db::queries::PgJobStore`);
//! [`MemoryJobStore`] backs tests and single-process embedding.
//!
//! Every mutating call reports whether it was applied. Writes made on behalf
//! of a running handler are guarded on the job still being `running`, and
//! terminal writes on it not being terminal yet, so a cancellation recorded
//! by another actor is never overwritten.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use garde::Validate;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{
    Job, JobMetadata, JobResult, JobStatus, JobType, MetadataPatch,
};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        job_type: JobType,
        metadata: &JobMetadata,
        user_id: Option<&str>,
    ) -> Result<Uuid, StoreError>;

    /// Job without its metadata blob (cheap enough to poll per batch).
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn get_job_with_metadata(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        percent: u8,
        patch: &MetadataPatch,
    ) -> Result<bool, StoreError>;

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Write the result envelope and the matching terminal status in one step.
    async fn save_job_result(&self, job_id: Uuid, result: &JobResult) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid job metadata: {0}")]
    InvalidMetadata(String),

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: Uuid, reason: String },
}

impl From<garde::Report> for StoreError {
    fn from(report: garde::Report) -> Self {
        StoreError::InvalidMetadata(report.to_string())
    }
}

/// Check metadata before it is persisted.
pub fn validate_metadata(job_type: JobType, metadata: &JobMetadata) -> Result<(), StoreError> {
    if metadata.params.job_type() != job_type {
        return Err(StoreError::InvalidMetadata(format!(
            "params are for {} but job type is {}",
            metadata.params.job_type(),
            job_type
        )));
    }
    metadata.params.validate()?;
    Ok(())
}

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a job including metadata.
    pub async fn snapshot(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub async fn job_ids(&self) -> Vec<Uuid> {
        self.jobs.read().await.keys().copied().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        job_type: JobType,
        metadata: &JobMetadata,
        user_id: Option<&str>,
    ) -> Result<Uuid, StoreError> {
        validate_metadata(job_type, metadata)?;
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            metadata: Some(metadata.clone()),
            result_data: None,
            error_message: None,
            user_id: user_id.map(str::to_string),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        let id = job.id;
        self.jobs.write().await.insert(id, job);
        Ok(id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).map(|job| Job {
            metadata: None,
            ..job.clone()
        }))
    }

    async fn get_job_with_metadata(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let Some(job) = jobs.get(&job_id) else {
            return Ok(None);
        };
        if job.metadata.is_none() {
            return Err(StoreError::Corrupt {
                job_id,
                reason: "metadata missing".to_string(),
            });
        }
        Ok(Some(job.clone()))
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(status) {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = status;
        job.updated_at = now;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        if status == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if status.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        percent: u8,
        patch: &MetadataPatch,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.progress = job.progress.max(percent.min(100));
        job.updated_at = Utc::now();
        if let Some(metadata) = job.metadata.as_mut() {
            metadata.counters = patch.counters.clone();
            metadata.preview = patch.preview.clone();
        }
        Ok(true)
    }

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.updated_at = Utc::now();
        if let Some(metadata) = job.metadata.as_mut() {
            metadata.checkpoint = Some(checkpoint.clone());
        }
        Ok(true)
    }

    async fn save_job_result(&self, job_id: Uuid, result: &JobResult) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        let status = result.status();
        if !job.status.can_transition_to(status) {
            return Ok(false);
        }
        let now = Utc::now();
        let value = serde_json::to_value(result)
            .map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
        job.status = status;
        job.result_data = Some(value);
        job.error_message = result.error.clone();
        if status == JobStatus::Completed {
            job.progress = 100;
        }
        job.updated_at = now;
        job.completed_at = Some(now);
        Ok(true)
    }
}
