use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::job::{GenerateParams, JobParams, JobType};
use crate::services::address::{is_valid_email, provider_domain};
use crate::services::batch::{Aggregate, BatchError, BatchHandler, BatchOutput, JobError};
use crate::services::generator::AddressGenerator;

pub const GENERATE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct GenerateStats {
    pub requested: usize,
    pub generated: usize,
    pub unique: usize,
    pub duplicates_removed: usize,
    pub invalid_removed: usize,
    pub domains: BTreeMap<String, usize>,
}

/// Generates candidate addresses in batches of [`GENERATE_BATCH_SIZE`].
pub struct GenerateHandler {
    generator: Arc<dyn AddressGenerator>,
}

impl GenerateHandler {
    pub fn new(generator: Arc<dyn AddressGenerator>) -> Self {
        Self { generator }
    }
}

/// Drop invalid addresses, dedupe case-insensitively keeping first
/// occurrences, then cap at `count`.
pub fn finalize_addresses(raw: Vec<String>, count: usize) -> (Vec<String>, GenerateStats) {
    let mut stats = GenerateStats {
        requested: count,
        generated: raw.len(),
        ..GenerateStats::default()
    };

    let mut seen = HashSet::with_capacity(raw.len());
    let mut unique = Vec::with_capacity(raw.len().min(count));
    for address in raw {
        let address = address.trim().to_string();
        if !is_valid_email(&address) {
            stats.invalid_removed += 1;
            continue;
        }
        if !seen.insert(address.to_ascii_lowercase()) {
            stats.duplicates_removed += 1;
            continue;
        }
        unique.push(address);
    }
    unique.truncate(count);

    for address in &unique {
        if let Some(domain) = provider_domain(address) {
            *stats.domains.entry(domain).or_default() += 1;
        }
    }
    stats.unique = unique.len();
    (unique, stats)
}

#[async_trait]
impl BatchHandler for GenerateHandler {
    type Params = GenerateParams;
    type Item = String;

    fn job_type(&self) -> JobType {
        JobType::Generate
    }

    fn batch_size(&self) -> usize {
        GENERATE_BATCH_SIZE
    }

    fn params<'p>(&self, params: &'p JobParams) -> Option<&'p GenerateParams> {
        match params {
            JobParams::Generate(p) => Some(p),
            _ => None,
        }
    }

    fn total_units(&self, params: &GenerateParams) -> usize {
        params.count
    }

    async fn process_batch(
        &self,
        params: &GenerateParams,
        units: Range<usize>,
    ) -> Result<BatchOutput<String>, BatchError> {
        let addresses = self.generator.generate(params, units.len()).await?;
        Ok(BatchOutput::local(addresses))
    }

    fn aggregate(&self, params: &GenerateParams, items: Vec<String>) -> Result<Aggregate, JobError> {
        let (addresses, stats) = finalize_addresses(items, params.count);
        tracing::info!(
            requested = stats.requested,
            unique = stats.unique,
            duplicates_removed = stats.duplicates_removed,
            invalid_removed = stats.invalid_removed,
            "Generated addresses finalized"
        );
        Ok(Aggregate {
            data: serde_json::json!({ "emails": addresses }),
            stats: serde_json::to_value(&stats)
                .map_err(|e| JobError::Invariant(format!("unserializable stats: {e}")))?,
        })
    }
}
