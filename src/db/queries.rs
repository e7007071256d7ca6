use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::job::{JobStatus, Transition, VerificationJob};
use crate::models::subject::Subject;
use crate::services::encryption::EncryptionService;
use crate::services::store::{JobStore, StoreError, WorkerLease};

/// Session advisory lock key held by the instance running the worker.
const WORKER_LOCK_KEY: i64 = 0x6361_7272_6965_7201;

const JOB_COLUMNS: &str = r#"
    id, subject_key, subject_encrypted, status, queue_position, progress,
    progress_message, result_carriers, result_files, error_message,
    created_at, updated_at, completed_at
"#;

/// Job store backed by the `verification_jobs` table.
///
/// The partial unique index `uq_verification_jobs_active_subject` enforces
/// one active job per subject. Only the instance holding the worker advisory
/// lock may recover or run jobs.
pub struct PgJobStore {
    pool: PgPool,
    encryption: Arc<EncryptionService>,
}

impl PgJobStore {
    pub fn new(pool: PgPool, encryption: Arc<EncryptionService>) -> Self {
        Self { pool, encryption }
    }

    fn row_to_job(&self, row: &PgRow) -> Result<VerificationJob, StoreError> {
        let status_str: String = row.try_get("status")?;
        let status = status_str
            .parse::<JobStatus>()
            .map_err(|_| StoreError::Corrupt(format!("unknown status '{status_str}'")))?;

        let queue_position: i32 = row.try_get("queue_position")?;
        let progress: i16 = row.try_get("progress")?;
        let encrypted: Vec<u8> = row.try_get("subject_encrypted")?;
        let subject: Subject = self.encryption.open(&encrypted)?;
        let Json(result_carriers): Json<Vec<String>> = row.try_get("result_carriers")?;
        let Json(result_files): Json<Vec<String>> = row.try_get("result_files")?;

        Ok(VerificationJob {
            id: row.try_get("id")?,
            subject_key: row.try_get("subject_key")?,
            subject,
            status,
            queue_position: u32::try_from(queue_position)
                .map_err(|_| StoreError::Corrupt(format!("queue position {queue_position}")))?,
            progress: u8::try_from(progress)
                .map_err(|_| StoreError::Corrupt(format!("progress {progress}")))?,
            progress_message: row.try_get("progress_message")?,
            result_carriers,
            result_files,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn lock_job(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
    ) -> Result<VerificationJob, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM verification_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::NotFound(job_id))?;

        self.row_to_job(&row)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &VerificationJob) -> Result<(), StoreError> {
        let encrypted = self.encryption.seal(&job.subject)?;

        let result = sqlx::query(
            r#"
            INSERT INTO verification_jobs
                (id, subject_key, subject_encrypted, status, queue_position, progress,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id)
        .bind(&job.subject_key)
        .bind(encrypted)
        .bind(job.status.to_string())
        .bind(job.queue_position as i32)
        .bind(i16::from(job.progress))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::ActiveJobExists(job.subject_key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<VerificationJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM verification_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_job(&r)).transpose()
    }

    async fn apply(
        &self,
        job_id: Uuid,
        transition: Transition,
    ) -> Result<VerificationJob, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut job = self.lock_job(&mut tx, job_id).await?;
        job.apply(transition)?;

        sqlx::query(
            r#"
            UPDATE verification_jobs
            SET status = $1,
                queue_position = $2,
                progress = $3,
                progress_message = $4,
                result_carriers = $5,
                result_files = $6,
                error_message = $7,
                updated_at = $8,
                completed_at = $9
            WHERE id = $10
            "#,
        )
        .bind(job.status.to_string())
        .bind(job.queue_position as i32)
        .bind(i16::from(job.progress))
        .bind(&job.progress_message)
        .bind(Json(&job.result_carriers))
        .bind(Json(&job.result_files))
        .bind(&job.error_message)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn find_active(&self, subject_key: &str) -> Result<Option<VerificationJob>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM verification_jobs
            WHERE subject_key = $1 AND status IN ('pending', 'processing')
            "#
        ))
        .bind(subject_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.row_to_job(&r)).transpose()
    }

    async fn list_active(&self) -> Result<Vec<VerificationJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM verification_jobs
            WHERE status IN ('pending', 'processing')
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_job(r)).collect()
    }

    async fn try_acquire_worker_lease(&self) -> Result<Option<WorkerLease>, StoreError> {
        // Session-level lock, held until this connection closes.
        let mut conn = self.pool.acquire().await?.detach();
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(WORKER_LOCK_KEY)
            .fetch_one(&mut conn)
            .await?;

        if locked {
            Ok(Some(WorkerLease::new(conn)))
        } else {
            Ok(None)
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
