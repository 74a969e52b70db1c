use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, job_type, subject_id, photoshoot_id, payload, status, attempts, \
     available_at, locked_by, locked_at, result, error, created_at, started_at, finished_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        subject_id: row.try_get("subject_id")?,
        photoshoot_id: row.try_get("photoshoot_id")?,
        payload: row.try_get("payload")?,
        status,
        attempts: row.try_get("attempts")?,
        available_at: row.try_get("available_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new queued job with zero attempts
pub async fn enqueue_job(pool: &PgPool, job: &NewJob) -> Result<Job, sqlx::Error> {
    let query = format!(
        "INSERT INTO generation_jobs (job_type, subject_id, photoshoot_id, payload, status, attempts) \
         VALUES ($1, $2, $3, $4, 'queued', 0) \
         RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&query)
        .bind(&job.job_type)
        .bind(job.subject_id)
        .bind(job.photoshoot_id)
        .bind(&job.payload)
        .fetch_one(pool)
        .await?;

    job_from_row(&row)
}

/// Atomically claim the oldest eligible queued job for a worker.
///
/// `FOR UPDATE SKIP LOCKED` lets concurrent workers scan the same candidates
/// without blocking on each other or claiming the same row twice.
pub async fn claim_next(pool: &PgPool, worker_id: &str) -> Result<Option<Job>, sqlx::Error> {
    let query = format!(
        "UPDATE generation_jobs \
         SET status = 'running', locked_by = $1, locked_at = NOW(), started_at = NOW() \
         WHERE id = ( \
             SELECT id FROM generation_jobs \
             WHERE status = 'queued' AND (available_at IS NULL OR available_at <= NOW()) \
             ORDER BY created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query(&query)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let query = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
    let row = sqlx::query(&query)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Mark a running job done with its result. Attempts are left alone.
/// Returns false if the job was not running.
pub async fn mark_done(
    pool: &PgPool,
    job_id: Uuid,
    result: &serde_json::Value,
) -> Result<bool, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET status = 'done',
            result = $2,
            error = NULL,
            locked_by = NULL,
            finished_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(result)
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

/// Record a failed attempt in one statement: bump `attempts` and either
/// requeue the job until `requeue_at` or, when that is `None`, fail it.
///
/// Applies only while the job is queued or running with `seen_attempts`
/// attempts, so a concurrent change or a terminal row leaves it untouched.
/// Returns whether the row was updated.
pub async fn record_failure(
    pool: &PgPool,
    job_id: Uuid,
    seen_attempts: i32,
    requeue_at: Option<DateTime<Utc>>,
    error: &str,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET attempts = attempts + 1,
            status = CASE WHEN $3::timestamptz IS NULL THEN 'failed' ELSE 'queued' END,
            available_at = COALESCE($3::timestamptz, available_at),
            error = $4,
            locked_by = NULL,
            locked_at = CASE WHEN $3::timestamptz IS NULL THEN locked_at ELSE NULL END,
            finished_at = CASE WHEN $3::timestamptz IS NULL THEN NOW() ELSE finished_at END
        WHERE id = $1 AND attempts = $2 AND status IN ('queued', 'running')
        "#,
    )
    .bind(job_id)
    .bind(seen_attempts)
    .bind(requeue_at)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() == 1)
}

/// Number of queued jobs eligible right now (for the queue depth gauge)
pub async fn queue_depth(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS depth
        FROM generation_jobs
        WHERE status = 'queued' AND (available_at IS NULL OR available_at <= NOW())
        "#,
    )
    .fetch_one(pool)
    .await?;

    row.try_get("depth")
}
