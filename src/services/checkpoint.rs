//! Checkpoint persistence for resumable batch jobs.
//!
//! A checkpoint is written after every batch and read once when a job
//! (re)starts. The manager refuses to persist a checkpoint that does not
//! cover the work recorded by the previous one.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::models::checkpoint::{Checkpoint, CheckpointMark};
use crate::models::job::JobType;
use crate::services::store::{JobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Unreadable checkpoint: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Checkpoint belongs to a {found} job, expected {expected}")]
    TypeMismatch { expected: JobType, found: JobType },

    #[error("Checkpoint would rewind from cursor {from} to {to}")]
    Rewind { from: usize, to: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn JobStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Resume point from a job's stored metadata, or an empty checkpoint.
    pub fn resume<T: DeserializeOwned>(
        &self,
        job_type: JobType,
        stored: Option<&serde_json::Value>,
    ) -> Result<Checkpoint<T>, CheckpointError> {
        let Some(raw) = stored.filter(|v| !v.is_null()) else {
            return Ok(Checkpoint::empty(job_type));
        };
        let checkpoint: Checkpoint<T> = serde_json::from_value(raw.clone())?;
        if checkpoint.job_type != job_type {
            return Err(CheckpointError::TypeMismatch {
                expected: job_type,
                found: checkpoint.job_type,
            });
        }
        Ok(checkpoint)
    }

    /// Persist `next` if it supersedes `previous`.
    ///
    /// Returns `false` when the store refused the write (job no longer running).
    pub async fn save<T: Serialize>(
        &self,
        job_id: Uuid,
        previous: CheckpointMark,
        next: &mut Checkpoint<T>,
    ) -> Result<bool, CheckpointError> {
        let mark = next.mark();
        if !previous.is_superseded_by(&mark) {
            return Err(CheckpointError::Rewind {
                from: previous.cursor,
                to: mark.cursor,
            });
        }
        next.saved_at = Utc::now();
        let blob = serde_json::to_value(&*next)?;
        let applied = self.store.save_checkpoint(job_id, &blob).await?;
        if applied {
            tracing::debug!(job_id = %job_id, cursor = mark.cursor, "Checkpoint saved");
        }
        Ok(applied)
    }
}
