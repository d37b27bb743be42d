use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::models::verification::{CachedVerification, VerificationOutcome, VerificationStatus};
use crate::services::verifier::{VerificationCache, VerifierError};

/// Verification verdicts cached in Postgres, keyed by normalized address.
#[derive(Clone)]
pub struct PgVerificationCache {
    pool: PgPool,
}

impl PgVerificationCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VerificationCache for PgVerificationCache {
    async fn get_many(
        &self,
        emails: &[String],
    ) -> Result<HashMap<String, CachedVerification>, VerifierError> {
        let rows = sqlx::query(
            r#"
            SELECT email, status, reason, verified_at
            FROM email_verification_cache
            WHERE email = ANY($1)
            "#,
        )
        .bind(emails)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = HashMap::with_capacity(rows.len());
        for row in rows {
            let email: String = row.try_get("email")?;
            let status: String = row.try_get("status")?;
            let status = VerificationStatus::from_str(&status).unwrap_or(VerificationStatus::Unknown);
            hits.insert(
                email.clone(),
                CachedVerification {
                    email,
                    status,
                    reason: row.try_get("reason")?,
                    verified_at: row.try_get("verified_at")?,
                },
            );
        }
        Ok(hits)
    }

    async fn put_many(&self, outcomes: &[VerificationOutcome]) -> Result<(), VerifierError> {
        if outcomes.is_empty() {
            return Ok(());
        }

        // ON CONFLICT cannot touch the same row twice in one statement.
        let latest: BTreeMap<&str, &VerificationOutcome> =
            outcomes.iter().map(|o| (o.email.as_str(), o)).collect();

        let emails: Vec<String> = latest.keys().map(|e| e.to_string()).collect();
        let statuses: Vec<String> = latest.values().map(|o| o.status.to_string()).collect();
        let reasons: Vec<Option<String>> = latest.values().map(|o| o.reason.clone()).collect();

        sqlx::query(
            r#"
            INSERT INTO email_verification_cache (email, status, reason, verified_at)
            SELECT email, status, reason, NOW()
            FROM UNNEST($1::text[], $2::text[], $3::text[]) AS t(email, status, reason)
            ON CONFLICT (email) DO UPDATE
            SET status = EXCLUDED.status,
                reason = EXCLUDED.reason,
                verified_at = EXCLUDED.verified_at
            "#,
        )
        .bind(&emails)
        .bind(&statuses)
        .bind(&reasons)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
