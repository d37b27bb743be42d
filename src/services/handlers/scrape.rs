use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::job::{JobParams, JobType, ScrapeParams};
use crate::services::address::{normalize_domain, normalize_email};
use crate::services::batch::{Aggregate, BatchError, BatchHandler, BatchOutput, JobError};
use crate::services::scraper::{CrawlOptions, ScrapeError, SiteScraper};

/// Per-domain record accumulated by a scrape job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainScrape {
    pub domain: String,
    pub emails: Vec<String>,
    pub pages_crawled: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct ScrapeStats {
    pub domains_total: usize,
    pub domains_succeeded: usize,
    pub domains_failed: usize,
    pub emails_found: usize,
    pub unique_emails: usize,
    /// Emails per successful domain.
    pub average_yield: f64,
}

/// Crawls one domain per batch.
pub struct ScrapeHandler {
    scraper: Arc<dyn SiteScraper>,
    delay: Duration,
}

impl ScrapeHandler {
    pub fn new(scraper: Arc<dyn SiteScraper>) -> Self {
        Self {
            scraper,
            delay: Duration::from_secs(2),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub fn summarize(domains: &[DomainScrape]) -> (Vec<String>, ScrapeStats) {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut emails_found = 0;
    let mut succeeded = 0;
    for record in domains {
        if record.error.is_none() {
            succeeded += 1;
            emails_found += record.emails.len();
        }
        for email in &record.emails {
            if seen.insert(email.clone()) {
                unique.push(email.clone());
            }
        }
    }

    let average_yield = if succeeded == 0 {
        0.0
    } else {
        emails_found as f64 / succeeded as f64
    };
    let stats = ScrapeStats {
        domains_total: domains.len(),
        domains_succeeded: succeeded,
        domains_failed: domains.len() - succeeded,
        emails_found,
        unique_emails: unique.len(),
        average_yield,
    };
    (unique, stats)
}

#[async_trait]
impl BatchHandler for ScrapeHandler {
    type Params = ScrapeParams;
    type Item = DomainScrape;

    fn job_type(&self) -> JobType {
        JobType::Scrape
    }

    fn batch_size(&self) -> usize {
        1
    }

    fn courtesy_delay(&self) -> Duration {
        self.delay
    }

    fn params<'p>(&self, params: &'p JobParams) -> Option<&'p ScrapeParams> {
        match params {
            JobParams::Scrape(p) => Some(p),
            _ => None,
        }
    }

    fn total_units(&self, params: &ScrapeParams) -> usize {
        params.domains.len()
    }

    async fn process_batch(
        &self,
        params: &ScrapeParams,
        units: Range<usize>,
    ) -> Result<BatchOutput<DomainScrape>, BatchError> {
        let options = CrawlOptions {
            max_depth: params.max_depth,
            max_pages: params.max_pages,
        };

        let mut records = Vec::with_capacity(units.len());
        for raw in &params.domains[units] {
            let domain = normalize_domain(raw);
            if domain.is_empty() || !domain.contains('.') {
                return Err(ScrapeError::InvalidDomain(raw.clone()).into());
            }

            let report = self.scraper.scrape(&domain, options).await?;
            let mut seen = HashSet::new();
            let emails: Vec<String> = report
                .emails
                .iter()
                .map(|e| normalize_email(e))
                .filter(|e| seen.insert(e.clone()))
                .collect();

            tracing::info!(
                domain = %domain,
                emails = emails.len(),
                pages = report.pages_crawled,
                "Domain scraped"
            );
            records.push(DomainScrape {
                domain,
                emails,
                pages_crawled: report.pages_crawled,
                error: None,
            });
        }
        Ok(BatchOutput::remote(records))
    }

    fn recover_batch(
        &self,
        params: &ScrapeParams,
        units: Range<usize>,
        error: &BatchError,
    ) -> Vec<DomainScrape> {
        params.domains[units]
            .iter()
            .map(|raw| DomainScrape {
                domain: normalize_domain(raw),
                emails: Vec::new(),
                pages_crawled: 0,
                error: Some(error.to_string()),
            })
            .collect()
    }

    fn tally(&self, items: &[DomainScrape]) -> (usize, usize) {
        let failed = items.iter().filter(|d| d.error.is_some()).count();
        (items.len() - failed, failed)
    }

    fn aggregate(&self, _params: &ScrapeParams, items: Vec<DomainScrape>) -> Result<Aggregate, JobError> {
        let (emails, stats) = summarize(&items);
        Ok(Aggregate {
            data: serde_json::json!({ "emails": emails, "domains": items }),
            stats: serde_json::to_value(&stats)
                .map_err(|e| JobError::Invariant(format!("unserializable stats: {e}")))?,
        })
    }
}
