use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobMetadata, JobResult, JobStatus, JobType, MetadataPatch};
use crate::services::store::{validate_metadata, JobStore, StoreError};

const JOB_COLUMNS: &str = "id, job_type, status, progress, result_data, error_message, user_id, \
                           created_at, updated_at, started_at, completed_at";

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn source_statuses(target: JobStatus) -> Vec<String> {
    target
        .allowed_sources()
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn job_from_row(row: &PgRow, with_metadata: bool) -> Result<Job, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt { job_id: id, reason };

    let job_type: String = row.try_get("job_type")?;
    let job_type = JobType::from_str(&job_type).map_err(|e| corrupt(format!("job_type: {e}")))?;
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status).map_err(|e| corrupt(format!("status: {e}")))?;
    let progress: i16 = row.try_get("progress")?;

    let metadata = if with_metadata {
        let raw: serde_json::Value = row.try_get("metadata")?;
        let metadata: JobMetadata =
            serde_json::from_value(raw).map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
        Some(metadata)
    } else {
        None
    };

    Ok(Job {
        id,
        job_type,
        status,
        progress: progress.clamp(0, 100) as u8,
        metadata,
        result_data: row.try_get("result_data")?,
        error_message: row.try_get("error_message")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(
        &self,
        job_type: JobType,
        metadata: &JobMetadata,
        user_id: Option<&str>,
    ) -> Result<Uuid, StoreError> {
        validate_metadata(job_type, metadata)?;
        let metadata =
            serde_json::to_value(metadata).map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, progress, metadata, user_id)
            VALUES ($1, $2, 'pending', 0, $3, $4)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_type.to_string())
        .bind(metadata)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| job_from_row(&r, false)).transpose()
    }

    async fn get_job_with_metadata(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}, metadata FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| job_from_row(&r, true)).transpose()
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                error_message = COALESCE($3, error_message),
                updated_at = NOW(),
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(job_id)
        .bind(status.to_string())
        .bind(error_message)
        .bind(source_statuses(status))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        percent: u8,
        patch: &MetadataPatch,
    ) -> Result<bool, StoreError> {
        let counters = serde_json::to_value(&patch.counters)
            .map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
        let preview = serde_json::Value::Array(patch.preview.clone());

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = GREATEST(progress, $2),
                metadata = jsonb_set(jsonb_set(metadata, '{counters}', $3), '{preview}', $4),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(i16::from(percent.min(100)))
        .bind(counters)
        .bind(preview)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET metadata = jsonb_set(metadata, '{checkpoint}', $2),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(checkpoint)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_job_result(&self, job_id: Uuid, result: &JobResult) -> Result<bool, StoreError> {
        let status = result.status();
        let envelope =
            serde_json::to_value(result).map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;

        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                result_data = $3,
                error_message = $4,
                progress = CASE WHEN $2 = 'completed' THEN 100 ELSE progress END,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            "#,
        )
        .bind(job_id)
        .bind(status.to_string())
        .bind(envelope)
        .bind(result.error.as_deref())
        .bind(source_statuses(status))
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
