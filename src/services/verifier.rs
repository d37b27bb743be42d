//! Verification provider and verdict cache boundaries.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::verification::{CachedVerification, VerificationOutcome, VerificationStatus};

/// Item limit of the bulk verification endpoint.
pub const MAX_BULK_SIZE: usize = 50;

#[async_trait]
pub trait EmailVerifier: Send + Sync {
    /// Whether `verify_bulk` is a single provider call.
    fn supports_bulk(&self) -> bool {
        false
    }

    async fn verify_one(&self, email: &str) -> Result<VerificationOutcome, VerifierError>;

    /// Verify up to [`MAX_BULK_SIZE`] addresses in one call.
    async fn verify_bulk(&self, emails: &[String]) -> Result<Vec<VerificationOutcome>, VerifierError> {
        let mut outcomes = Vec::with_capacity(emails.len());
        for email in emails {
            outcomes.push(self.verify_one(email).await?);
        }
        Ok(outcomes)
    }
}

#[async_trait]
pub trait VerificationCache: Send + Sync {
    async fn get_many(
        &self,
        emails: &[String],
    ) -> Result<HashMap<String, CachedVerification>, VerifierError>;

    async fn put_many(&self, outcomes: &[VerificationOutcome]) -> Result<(), VerifierError>;
}

#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Verification provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Unexpected provider response: {0}")]
    Response(String),

    #[error("Verification cache error: {0}")]
    Cache(#[from] sqlx::Error),
}

/// Client for a JSON-over-HTTP verification provider.
///
/// `POST {base}/v1/verify` takes `{"email"}`; `POST {base}/v1/verify/bulk`
/// takes `{"emails": [...]}` and answers `{"results": [...]}`.
pub struct HttpVerifier {
    http: Client,
    base_url: String,
    api_key: String,
    bulk: bool,
}

#[derive(Serialize)]
struct SingleRequest<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct BulkRequest<'a> {
    emails: &'a [String],
}

#[derive(Deserialize)]
struct ProviderVerdict {
    email: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct BulkResponse {
    results: Vec<ProviderVerdict>,
}

impl From<ProviderVerdict> for VerificationOutcome {
    fn from(verdict: ProviderVerdict) -> Self {
        VerificationOutcome {
            email: verdict.email.trim().to_ascii_lowercase(),
            status: VerificationStatus::from_provider(&verdict.status),
            reason: verdict.reason,
        }
    }
}

impl HttpVerifier {
    pub fn new(
        base_url: &str,
        api_key: &str,
        bulk: bool,
        timeout: Duration,
    ) -> Result<Self, VerifierError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            bulk,
        })
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, VerifierError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VerifierError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl EmailVerifier for HttpVerifier {
    fn supports_bulk(&self) -> bool {
        self.bulk
    }

    async fn verify_one(&self, email: &str) -> Result<VerificationOutcome, VerifierError> {
        let verdict: ProviderVerdict = self.post("/v1/verify", &SingleRequest { email }).await?;
        Ok(verdict.into())
    }

    async fn verify_bulk(&self, emails: &[String]) -> Result<Vec<VerificationOutcome>, VerifierError> {
        if emails.len() > MAX_BULK_SIZE {
            return Err(VerifierError::Response(format!(
                "bulk request of {} exceeds the {} item limit",
                emails.len(),
                MAX_BULK_SIZE
            )));
        }
        let response: BulkResponse = self.post("/v1/verify/bulk", &BulkRequest { emails }).await?;
        Ok(response.results.into_iter().map(Into::into).collect())
    }
}

/// Verdict cache held in process memory.
#[derive(Default)]
pub struct MemoryVerificationCache {
    entries: RwLock<HashMap<String, CachedVerification>>,
}

impl MemoryVerificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl VerificationCache for MemoryVerificationCache {
    async fn get_many(
        &self,
        emails: &[String],
    ) -> Result<HashMap<String, CachedVerification>, VerifierError> {
        let entries = self.entries.read().await;
        Ok(emails
            .iter()
            .filter_map(|email| entries.get(email).map(|hit| (email.clone(), hit.clone())))
            .collect())
    }

    async fn put_many(&self, outcomes: &[VerificationOutcome]) -> Result<(), VerifierError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        for outcome in outcomes {
            entries.insert(
                outcome.email.clone(),
                CachedVerification {
                    email: outcome.email.clone(),
                    status: outcome.status,
                    reason: outcome.reason.clone(),
                    verified_at: now,
                },
            );
        }
        Ok(())
    }
}
