use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Kind of bulk operation a job performs.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    Generate,
    Verify,
    Scrape,
}

/// Lifecycle status of a job.
///
/// `pending → running → {completed | failed | cancelled}`; a pending job may
/// also be cancelled or failed directly. Terminal states never change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses from which a transition into `self` is allowed.
    pub fn allowed_sources(self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Pending],
            Self::Running => &[Self::Pending, Self::Running],
            Self::Completed | Self::Failed | Self::Cancelled => &[Self::Pending, Self::Running],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next.allowed_sources().contains(&self)
    }
}

/// A bulk job as persisted in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    /// Only populated by `get_job_with_metadata`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMetadata>,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Metadata blob stored alongside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub params: JobParams,
    /// Opaque, type-specific resume point. Owned by the checkpoint manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<serde_json::Value>,
    #[serde(default)]
    pub counters: JobCounters,
    /// Most recent partial results, bounded in size.
    #[serde(default)]
    pub preview: Vec<serde_json::Value>,
}

impl JobMetadata {
    pub fn new(params: JobParams) -> Self {
        Self {
            params,
            checkpoint: None,
            counters: JobCounters::default(),
            preview: Vec::new(),
        }
    }
}

/// Rolling counters written after every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total_items: usize,
    pub processed_items: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failed_batches: usize,
}

/// Partial metadata update applied together with a progress write.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataPatch {
    pub counters: JobCounters,
    pub preview: Vec<serde_json::Value>,
}

/// Request parameters, tagged by job type.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobParams {
    Generate(#[garde(dive)] GenerateParams),
    Verify(#[garde(dive)] VerifyParams),
    Scrape(#[garde(dive)] ScrapeParams),
}

impl JobParams {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::Generate(_) => JobType::Generate,
            Self::Verify(_) => JobType::Verify,
            Self::Scrape(_) => JobType::Scrape,
        }
    }
}

/// Naming patterns understood by the address generator.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AddressPattern {
    FirstDotLast,
    FirstLast,
    FirstInitialLast,
    FirstUnderscoreLast,
    LastDotFirst,
    FirstLastYear,
    FirstDigits,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GenerateParams {
    #[garde(range(min = 1, max = 1_000_000))]
    pub count: usize,

    /// Provider domains addresses are spread across.
    #[garde(length(min = 1, max = 50), inner(length(min = 3, max = 253)))]
    pub domains: Vec<String>,

    /// Empty means every pattern.
    #[serde(default)]
    #[garde(skip)]
    pub patterns: Vec<AddressPattern>,

    /// Empty means the generator's built-in name pool.
    #[serde(default)]
    #[garde(length(max = 10_000), inner(length(min = 1, max = 64)))]
    pub first_names: Vec<String>,

    #[serde(default)]
    #[garde(length(max = 10_000), inner(length(min = 1, max = 64)))]
    pub last_names: Vec<String>,

    #[serde(default)]
    #[garde(dive)]
    pub birth_years: Option<BirthYearRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct BirthYearRange {
    #[garde(range(min = 1900, max = 2030))]
    pub from: u16,
    #[garde(range(min = 1900, max = 2030))]
    pub to: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VerifyParams {
    #[garde(length(min = 1, max = 200_000), inner(length(min = 3, max = 320)))]
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScrapeParams {
    #[garde(length(min = 1, max = 5_000), inner(length(min = 3, max = 253)))]
    pub domains: Vec<String>,

    /// How many link hops to follow from the home page.
    #[serde(default = "default_max_depth")]
    #[garde(range(max = 3))]
    pub max_depth: u8,

    #[serde(default = "default_max_pages")]
    #[garde(range(min = 1, max = 50))]
    pub max_pages: usize,
}

fn default_max_depth() -> u8 {
    1
}

fn default_max_pages() -> usize {
    10
}

/// Terminal result envelope written to `result_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

impl JobResult {
    pub fn success(data: serde_json::Value, stats: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            stats: Some(stats),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            stats: None,
        }
    }

    /// Terminal status this result moves the job into.
    pub fn status(&self) -> JobStatus {
        if self.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_terminal_states_never_transition() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_running_is_idempotent() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn test_status_string_round_trip() {
        assert_eq!(JobStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(JobStatus::from_str("running").unwrap(), JobStatus::Running);
        assert_eq!(JobType::from_str("scrape").unwrap(), JobType::Scrape);
    }

    #[test]
    fn test_params_are_tagged_by_type() {
        let params: JobParams = serde_json::from_value(serde_json::json!({
            "type": "scrape",
            "domains": ["example.com"]
        }))
        .unwrap();
        assert_eq!(params.job_type(), JobType::Scrape);
        match params {
            JobParams::Scrape(p) => {
                assert_eq!(p.max_depth, 1);
                assert_eq!(p.max_pages, 10);
            }
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[test]
    fn test_params_validation() {
        let empty = JobParams::Verify(VerifyParams { emails: vec![] });
        assert!(empty.validate().is_err());

        let zero = JobParams::Generate(GenerateParams {
            count: 0,
            domains: vec!["gmail.com".to_string()],
            patterns: vec![],
            first_names: vec![],
            last_names: vec![],
            birth_years: None,
        });
        assert!(zero.validate().is_err());

        let ok = JobParams::Scrape(ScrapeParams {
            domains: vec!["example.com".to_string()],
            max_depth: 2,
            max_pages: 5,
        });
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_result_envelope_status() {
        assert_eq!(
            JobResult::success(serde_json::json!([]), serde_json::json!({})).status(),
            JobStatus::Completed
        );
        let failed = JobResult::failure("boom");
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"success": false, "error": "boom"})
        );
    }
}
