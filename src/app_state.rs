use std::sync::Arc;

use crate::services::{
    jobs::JobService, queue::JobQueue, store::JobStore, worker_pool::WorkerPool,
};

/// Shared state passed to the ops route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub pool: Arc<WorkerPool>,
    pub jobs: Arc<JobService>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, pool: Arc<WorkerPool>) -> Self {
        let jobs = Arc::new(JobService::new(
            store.clone(),
            queue.clone(),
            pool.cancellations(),
        ));
        Self {
            store,
            queue,
            pool,
            jobs,
        }
    }
}
