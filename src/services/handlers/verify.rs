use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::models::job::{JobParams, JobType, VerifyParams};
use crate::models::verification::{
    VerificationOutcome, VerificationStatus, VerificationSummary, VerifiedEmail,
};
use crate::services::address::{is_valid_email, normalize_email};
use crate::services::batch::{Aggregate, BatchError, BatchHandler, BatchOutput, JobError};
use crate::services::verifier::{EmailVerifier, VerificationCache, MAX_BULK_SIZE};

pub const VERIFY_BATCH_SIZE: usize = MAX_BULK_SIZE;

/// Concurrent single-address calls when the provider has no bulk endpoint.
pub const VERIFY_FANOUT: usize = 5;

/// Verifies addresses, serving stable verdicts from the cache.
pub struct VerifyHandler {
    verifier: Arc<dyn EmailVerifier>,
    cache: Arc<dyn VerificationCache>,
    delay: Duration,
}

impl VerifyHandler {
    pub fn new(verifier: Arc<dyn EmailVerifier>, cache: Arc<dyn VerificationCache>) -> Self {
        Self {
            verifier,
            cache,
            delay: Duration::from_secs(1),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn cached_verdicts(&self, emails: &[String]) -> HashMap<String, VerifiedEmail> {
        match self.cache.get_many(emails).await {
            Ok(hits) => hits
                .into_values()
                .filter(|hit| hit.status.is_stable())
                .map(|hit| {
                    let entry = VerifiedEmail {
                        email: hit.email.clone(),
                        status: hit.status,
                        reason: hit.reason,
                        cached: true,
                    };
                    (hit.email, entry)
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Verification cache read failed, treating batch as uncached");
                HashMap::new()
            }
        }
    }

    async fn verify_fresh(&self, emails: &[String]) -> Result<Vec<VerificationOutcome>, BatchError> {
        if self.verifier.supports_bulk() {
            return Ok(self.verifier.verify_bulk(emails).await?);
        }

        // Each future owns its inputs so the stream stays `Send`.
        let verifier = self.verifier.clone();
        let outcomes = stream::iter(emails.to_vec().into_iter().map(move |email| {
            let verifier = verifier.clone();
            async move {
                match verifier.verify_one(&email).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(email = %email, error = %e, "Single verification failed");
                        VerificationOutcome::unknown(email, e.to_string())
                    }
                }
            }
        }))
        .buffered(VERIFY_FANOUT)
        .collect::<Vec<_>>()
        .await;
        Ok(outcomes)
    }

    async fn write_through(&self, outcomes: &[VerificationOutcome]) {
        let cacheable: Vec<VerificationOutcome> = outcomes
            .iter()
            .filter(|o| o.status != VerificationStatus::Unknown)
            .cloned()
            .collect();
        if cacheable.is_empty() {
            return;
        }
        if let Err(e) = self.cache.put_many(&cacheable).await {
            tracing::warn!(error = %e, count = cacheable.len(), "Verification cache write failed");
        }
    }
}

#[async_trait]
impl BatchHandler for VerifyHandler {
    type Params = VerifyParams;
    type Item = VerifiedEmail;

    fn job_type(&self) -> JobType {
        JobType::Verify
    }

    fn batch_size(&self) -> usize {
        VERIFY_BATCH_SIZE
    }

    fn courtesy_delay(&self) -> Duration {
        self.delay
    }

    fn params<'p>(&self, params: &'p JobParams) -> Option<&'p VerifyParams> {
        match params {
            JobParams::Verify(p) => Some(p),
            _ => None,
        }
    }

    fn total_units(&self, params: &VerifyParams) -> usize {
        params.emails.len()
    }

    async fn process_batch(
        &self,
        params: &VerifyParams,
        units: Range<usize>,
    ) -> Result<BatchOutput<VerifiedEmail>, BatchError> {
        let emails: Vec<String> = params.emails[units]
            .iter()
            .map(|e| normalize_email(e))
            .collect();

        let well_formed: Vec<String> = emails.iter().filter(|e| is_valid_email(e)).cloned().collect();
        let cached = self.cached_verdicts(&well_formed).await;

        let mut seen = HashSet::new();
        let uncached: Vec<String> = well_formed
            .into_iter()
            .filter(|e| !cached.contains_key(e) && seen.insert(e.clone()))
            .collect();

        let mut fresh: HashMap<String, VerificationOutcome> = HashMap::new();
        let mut failure = None;
        if !uncached.is_empty() {
            match self.verify_fresh(&uncached).await {
                Ok(outcomes) => {
                    self.write_through(&outcomes).await;
                    fresh = outcomes.into_iter().map(|o| (o.email.clone(), o)).collect();
                }
                Err(e) => {
                    tracing::warn!(error = %e, count = uncached.len(), "Verification provider failed");
                    failure = Some(e.to_string());
                }
            }
        }

        let items = emails
            .into_iter()
            .map(|email| {
                if let Some(hit) = cached.get(&email) {
                    return hit.clone();
                }
                if !is_valid_email(&email) {
                    return VerifiedEmail {
                        email,
                        status: VerificationStatus::Invalid,
                        reason: Some("invalid syntax".to_string()),
                        cached: false,
                    };
                }
                let outcome = fresh.get(&email).cloned().unwrap_or_else(|| {
                    let reason = failure.as_deref().unwrap_or("no verdict returned");
                    VerificationOutcome::unknown(email.clone(), reason)
                });
                VerifiedEmail {
                    email,
                    status: outcome.status,
                    reason: outcome.reason,
                    cached: false,
                }
            })
            .collect();

        let output = if uncached.is_empty() {
            BatchOutput::local(items)
        } else {
            BatchOutput::remote(items)
        };
        Ok(match failure {
            Some(reason) => output.degraded(reason),
            None => output,
        })
    }

    fn recover_batch(
        &self,
        params: &VerifyParams,
        units: Range<usize>,
        error: &BatchError,
    ) -> Vec<VerifiedEmail> {
        params.emails[units]
            .iter()
            .map(|email| VerifiedEmail {
                email: normalize_email(email),
                status: VerificationStatus::Unknown,
                reason: Some(error.to_string()),
                cached: false,
            })
            .collect()
    }

    fn tally(&self, items: &[VerifiedEmail]) -> (usize, usize) {
        let unknown = items
            .iter()
            .filter(|i| i.status == VerificationStatus::Unknown)
            .count();
        (items.len() - unknown, unknown)
    }

    fn aggregate(&self, _params: &VerifyParams, items: Vec<VerifiedEmail>) -> Result<Aggregate, JobError> {
        let summary = VerificationSummary::from_results(&items);
        tracing::info!(
            total = summary.total,
            valid = summary.valid,
            risky = summary.risky,
            invalid = summary.invalid,
            unknown = summary.unknown,
            cached = summary.cached,
            "Verification finalized"
        );
        Ok(Aggregate {
            data: serde_json::json!({ "results": items }),
            stats: serde_json::to_value(&summary)
                .map_err(|e| JobError::Invariant(format!("unserializable summary: {e}")))?,
        })
    }
}
