//! Test helpers: collaborator fakes and a recording job store.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bulk_mail_jobs::models::job::{
    GenerateParams, Job, JobMetadata, JobParams, JobResult, JobStatus, JobType, MetadataPatch,
    ScrapeParams, VerifyParams,
};
use bulk_mail_jobs::models::verification::{
    CachedVerification, VerificationOutcome, VerificationStatus,
};
use bulk_mail_jobs::services::generator::{AddressGenerator, GeneratorError};
use bulk_mail_jobs::services::scraper::{CrawlOptions, CrawlReport, ScrapeError, SiteScraper};
use bulk_mail_jobs::services::store::{JobStore, MemoryJobStore, StoreError};
use bulk_mail_jobs::services::verifier::{EmailVerifier, VerificationCache, VerifierError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn generate_params(count: usize) -> JobParams {
    JobParams::Generate(GenerateParams {
        count,
        domains: vec!["example.com".to_string()],
        patterns: vec![],
        first_names: vec![],
        last_names: vec![],
        birth_years: None,
    })
}

pub fn verify_params(emails: Vec<String>) -> JobParams {
    JobParams::Verify(VerifyParams { emails })
}

pub fn scrape_params(domains: &[&str]) -> JobParams {
    JobParams::Scrape(ScrapeParams {
        domains: domains.iter().map(|d| d.to_string()).collect(),
        max_depth: 1,
        max_pages: 5,
    })
}

pub async fn create_job(store: &dyn JobStore, params: JobParams) -> Uuid {
    store
        .create_job(params.job_type(), &JobMetadata::new(params), Some("user-1"))
        .await
        .expect("create job")
}

/// Poll the store until the job reaches a terminal status.
pub async fn wait_for_terminal(store: &dyn JobStore, job_id: Uuid, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get_job(job_id).await.unwrap().expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} still {} after {timeout:?}",
            job.status
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Produces unique `user{n}@example.com` addresses and records call sizes.
#[derive(Default)]
pub struct SequentialGenerator {
    next: AtomicUsize,
    pub calls: Mutex<Vec<usize>>,
    delay: Option<Duration>,
}

impl SequentialGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long on every call.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressGenerator for SequentialGenerator {
    async fn generate(
        &self,
        _params: &GenerateParams,
        count: usize,
    ) -> Result<Vec<String>, GeneratorError> {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        self.calls.lock().unwrap().push(count);
        let start = self.next.fetch_add(count, Ordering::SeqCst);
        Ok((start..start + count)
            .map(|n| format!("user{n}@example.com"))
            .collect())
    }
}

/// Returns a fixed list of addresses on every call.
pub struct ScriptedGenerator {
    pub output: Vec<String>,
}

#[async_trait]
impl AddressGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _params: &GenerateParams,
        _count: usize,
    ) -> Result<Vec<String>, GeneratorError> {
        Ok(self.output.clone())
    }
}

/// Verifier that records every address it is asked about.
///
/// Verdicts: addresses containing "risky" are risky, "bad" invalid, the rest valid.
pub struct RecordingVerifier {
    bulk: bool,
    failing: AtomicBool,
    pub sent: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl RecordingVerifier {
    pub fn bulk() -> Self {
        Self::new(true)
    }

    pub fn single() -> Self {
        Self::new(false)
    }

    fn new(bulk: bool) -> Self {
        Self {
            bulk,
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn verdict(email: &str) -> VerificationOutcome {
        let status = if email.contains("risky") {
            VerificationStatus::Risky
        } else if email.contains("bad") {
            VerificationStatus::Invalid
        } else {
            VerificationStatus::Valid
        };
        VerificationOutcome {
            email: email.to_string(),
            status,
            reason: None,
        }
    }

    fn check(&self) -> Result<(), VerifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(VerifierError::Provider {
                status: 503,
                body: "provider unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EmailVerifier for RecordingVerifier {
    fn supports_bulk(&self) -> bool {
        self.bulk
    }

    async fn verify_one(&self, email: &str) -> Result<VerificationOutcome, VerifierError> {
        self.check()?;
        self.sent.lock().unwrap().push(email.to_string());
        Ok(Self::verdict(email))
    }

    async fn verify_bulk(&self, emails: &[String]) -> Result<Vec<VerificationOutcome>, VerifierError> {
        self.check()?;
        self.sent.lock().unwrap().extend(emails.iter().cloned());
        Ok(emails.iter().map(|e| Self::verdict(e)).collect())
    }
}

/// Cache whose every call fails.
pub struct BrokenCache;

#[async_trait]
impl VerificationCache for BrokenCache {
    async fn get_many(
        &self,
        _emails: &[String],
    ) -> Result<HashMap<String, CachedVerification>, VerifierError> {
        Err(VerifierError::Response("cache offline".to_string()))
    }

    async fn put_many(&self, _outcomes: &[VerificationOutcome]) -> Result<(), VerifierError> {
        Err(VerifierError::Response("cache offline".to_string()))
    }
}

/// Scraper that finds `info@{domain}` and `sales@{domain}`, failing for listed domains.
#[derive(Default)]
pub struct FakeScraper {
    failing: HashSet<String>,
    pub visited: Mutex<Vec<String>>,
}

impl FakeScraper {
    pub fn failing_for(domains: &[&str]) -> Self {
        Self {
            failing: domains.iter().map(|d| d.to_string()).collect(),
            visited: Mutex::new(Vec::new()),
        }
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }
}

#[async_trait]
impl SiteScraper for FakeScraper {
    async fn scrape(&self, domain: &str, _options: CrawlOptions) -> Result<CrawlReport, ScrapeError> {
        self.visited.lock().unwrap().push(domain.to_string());
        if self.failing.contains(domain) {
            return Err(ScrapeError::Unavailable(format!("{domain} timed out")));
        }
        Ok(CrawlReport {
            emails: vec![format!("Info@{domain}"), format!("sales@{domain}")],
            pages_crawled: 2,
        })
    }
}

/// What the recording store does once a given number of checkpoints is saved.
pub enum CheckpointHook {
    /// Another actor cancels the job.
    CancelJob,
    /// The worker starts shutting down.
    Trip(CancellationToken),
}

/// Job store that records progress and checkpoint writes.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryJobStore,
    progress: Mutex<Vec<u8>>,
    checkpoints: Mutex<Vec<serde_json::Value>>,
    hook: Mutex<Option<(usize, CheckpointHook)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(after_checkpoints: usize, hook: CheckpointHook) -> Self {
        Self {
            hook: Mutex::new(Some((after_checkpoints, hook))),
            ..Self::default()
        }
    }

    pub fn progress(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }

    pub fn checkpoints(&self) -> Vec<serde_json::Value> {
        self.checkpoints.lock().unwrap().clone()
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Job {
        self.inner.snapshot(job_id).await.expect("job exists")
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn create_job(
        &self,
        job_type: JobType,
        metadata: &JobMetadata,
        user_id: Option<&str>,
    ) -> Result<Uuid, StoreError> {
        self.inner.create_job(job_type, metadata, user_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn get_job_with_metadata(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job_with_metadata(job_id).await
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner.update_job_status(job_id, status, error_message).await
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        percent: u8,
        patch: &MetadataPatch,
    ) -> Result<bool, StoreError> {
        let applied = self.inner.update_job_progress(job_id, percent, patch).await?;
        if applied {
            self.progress.lock().unwrap().push(percent);
        }
        Ok(applied)
    }

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let applied = self.inner.save_checkpoint(job_id, checkpoint).await?;
        if !applied {
            return Ok(false);
        }

        let saved = {
            let mut checkpoints = self.checkpoints.lock().unwrap();
            checkpoints.push(checkpoint.clone());
            checkpoints.len()
        };
        let fire = {
            let mut hook = self.hook.lock().unwrap();
            let due = matches!(hook.as_ref(), Some((after, _)) if *after == saved);
            if due {
                hook.take()
            } else {
                None
            }
        };
        match fire {
            Some((_, CheckpointHook::CancelJob)) => {
                self.inner
                    .update_job_status(job_id, JobStatus::Cancelled, None)
                    .await?;
            }
            Some((_, CheckpointHook::Trip(token))) => token.cancel(),
            None => {}
        }
        Ok(true)
    }

    async fn save_job_result(&self, job_id: Uuid, result: &JobResult) -> Result<bool, StoreError> {
        self.inner.save_job_result(job_id, result).await
    }
}

/// Store that rejects every write with a database error.
pub struct UnreachableStore {
    pub inner: Arc<MemoryJobStore>,
}

fn unreachable() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl JobStore for UnreachableStore {
    async fn create_job(
        &self,
        job_type: JobType,
        metadata: &JobMetadata,
        user_id: Option<&str>,
    ) -> Result<Uuid, StoreError> {
        self.inner.create_job(job_type, metadata, user_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn get_job_with_metadata(&self, _job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Err(unreachable())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner.update_job_status(job_id, status, error_message).await
    }

    async fn update_job_progress(
        &self,
        _job_id: Uuid,
        _percent: u8,
        _patch: &MetadataPatch,
    ) -> Result<bool, StoreError> {
        Err(unreachable())
    }

    async fn save_checkpoint(
        &self,
        _job_id: Uuid,
        _checkpoint: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        Err(unreachable())
    }

    async fn save_job_result(&self, _job_id: Uuid, _result: &JobResult) -> Result<bool, StoreError> {
        Err(unreachable())
    }
}
