pub mod checkpoint;
pub mod job;
pub mod verification;
