pub mod address;
pub mod batch;
pub mod checkpoint;
pub mod generator;
pub mod handlers;
pub mod jobs;
pub mod memory_queue;
pub mod queue;
pub mod scraper;
pub mod store;
pub mod supervisor;
pub mod verifier;
pub mod worker_pool;
