//! Bulk Mail Jobs
//!
//! Resumable background-job execution for bulk email work: address
//! generation, address verification and contact scraping. Jobs run on a
//! queue-backed worker pool with per-batch checkpoints, cooperative
//! cancellation and rate-limited calls to third-party providers.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
