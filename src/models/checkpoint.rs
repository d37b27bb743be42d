use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobType;

/// Resume point for a batch job.
///
/// `cursor` is the index of the next unit to process; everything before it
/// has been attempted and its output folded into `accumulator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<T> {
    pub job_type: JobType,
    pub cursor: usize,
    pub accumulator: Vec<T>,
    pub batches_completed: usize,
    pub failed_batches: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub saved_at: DateTime<Utc>,
}

impl<T> Checkpoint<T> {
    pub fn empty(job_type: JobType) -> Self {
        Self {
            job_type,
            cursor: 0,
            accumulator: Vec::new(),
            batches_completed: 0,
            failed_batches: 0,
            succeeded: 0,
            failed: 0,
            saved_at: Utc::now(),
        }
    }

    pub fn mark(&self) -> CheckpointMark {
        CheckpointMark {
            cursor: self.cursor,
            accumulated: self.accumulator.len(),
        }
    }
}

/// Position of a checkpoint, used to reject rewinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMark {
    pub cursor: usize,
    pub accumulated: usize,
}

impl CheckpointMark {
    /// True when `next` covers at least the work recorded by `self`.
    pub fn is_superseded_by(&self, next: &CheckpointMark) -> bool {
        next.cursor > self.cursor && next.accumulated >= self.accumulated
    }
}
