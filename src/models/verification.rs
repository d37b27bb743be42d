use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Deliverability verdict for a single address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationStatus {
    Valid,
    Invalid,
    Risky,
    Unknown,
}

impl VerificationStatus {
    /// Map a provider's verdict string onto our four buckets.
    pub fn from_provider(verdict: &str) -> Self {
        match verdict.trim().to_ascii_lowercase().as_str() {
            "valid" | "deliverable" | "ok" => Self::Valid,
            "invalid" | "undeliverable" | "bounce" | "do_not_mail" => Self::Invalid,
            "risky" | "accept_all" | "catch_all" | "catch-all" | "disposable" | "role" => {
                Self::Risky
            }
            _ => Self::Unknown,
        }
    }

    /// Whether a cached verdict can be reused without asking the provider again.
    ///
    /// Risky and unknown verdicts are re-verified on every encounter.
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

/// Fresh answer from a verification provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub email: String,
    pub status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationOutcome {
    pub fn unknown(email: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            status: VerificationStatus::Unknown,
            reason: Some(reason.into()),
        }
    }
}

/// Verdict previously stored in the verification cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVerification {
    pub email: String,
    pub status: VerificationStatus,
    pub reason: Option<String>,
    pub verified_at: DateTime<Utc>,
}

/// Per-address entry accumulated by a verify job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedEmail {
    pub email: String,
    pub status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Served from the cache instead of the provider.
    pub cached: bool,
}

/// Final summary of a verify job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub valid: usize,
    pub risky: usize,
    pub invalid: usize,
    pub unknown: usize,
    pub cached: usize,
    pub verified: usize,
}

impl VerificationSummary {
    pub fn from_results(results: &[VerifiedEmail]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.status {
                VerificationStatus::Valid => summary.valid += 1,
                VerificationStatus::Risky => summary.risky += 1,
                VerificationStatus::Invalid => summary.invalid += 1,
                VerificationStatus::Unknown => summary.unknown += 1,
            }
            if result.cached {
                summary.cached += 1;
            } else {
                summary.verified += 1;
            }
        }
        summary
    }
}
