//! Job type handlers and the registry the worker pool dispatches through.

pub mod generate;
pub mod scrape;
pub mod verify;

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::job::JobType;
use crate::services::batch::{JobContext, JobError, JobRunner, RunOutcome};

/// Maps each job type to the runner that executes it.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    runners: HashMap<JobType, Arc<dyn JobRunner>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner, replacing any previous one for the same type.
    pub fn register(&mut self, runner: Arc<dyn JobRunner>) {
        let job_type = runner.job_type();
        if self.runners.insert(job_type, runner).is_some() {
            tracing::warn!(job_type = %job_type, "Replacing registered job runner");
        }
    }

    pub fn with(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.register(runner);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.runners.keys().copied().collect();
        types.sort_by_key(|t| t.to_string());
        types
    }

    pub async fn dispatch(&self, ctx: &JobContext) -> Result<RunOutcome, JobError> {
        let runner = self
            .get(ctx.job_type)
            .ok_or(JobError::UnknownJobType(ctx.job_type))?;
        runner.run(ctx).await
    }
}
