use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::store::{check_transition, JobStore, StoreError};
use crate::models::job::{Job, JobPatch, JobPayload, JobStatus, StatusTransition};

const JOB_COLUMNS: &str = r#"
    id, title, description, tags, status, scheduled_at, attempt_count, last_error,
    payload, external_id, external_url, created_at, updated_at
"#;

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    JobStatus::from_str(raw).map_err(|_| StoreError::Corrupt(format!("unknown status '{}'", raw)))
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    let payload: Json<JobPayload> = row.try_get("payload")?;

    Ok(Job {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        tags: row.try_get("tags")?,
        status: parse_status(&status)?,
        scheduled_at: row.try_get("scheduled_at")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
        payload: payload.0,
        external_id: row.try_get("external_id")?,
        external_url: row.try_get("external_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: Job) -> Result<Uuid, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs
                (id, title, description, tags, status, scheduled_at, attempt_count,
                 last_error, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.tags)
        .bind(job.status.to_string())
        .bind(job.scheduled_at)
        .bind(job.attempt_count)
        .bind(&job.last_error)
        .bind(Json(&job.payload))
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate(job.id));
        }

        sqlx::query(
            r#"
            INSERT INTO job_transitions (job_id, from_status, to_status, at)
            VALUES ($1, NULL, $2, $3)
            "#,
        )
        .bind(job.id)
        .bind(job.status.to_string())
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job.id)
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scheduled_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => job_from_row(&r),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        statuses: &[JobStatus],
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM scheduled_jobs
            WHERE status = ANY($1) AND scheduled_at <= $2
            ORDER BY scheduled_at ASC, id ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        ))
        .bind(status_names(statuses))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        new: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, StoreError> {
        check_transition(expected, new)?;

        let mut tx = self.pool.begin().await?;

        let (set_error, last_error) = match patch.last_error {
            Some(value) => (true, value),
            None => (false, None),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE scheduled_jobs
            SET status = $3,
                attempt_count = COALESCE($4, attempt_count),
                last_error = CASE WHEN $5 THEN $6 ELSE last_error END,
                external_id = COALESCE($7, external_id),
                external_url = COALESCE($8, external_url),
                scheduled_at = COALESCE($9, scheduled_at),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(expected.to_string())
        .bind(new.to_string())
        .bind(patch.attempt_count)
        .bind(set_error)
        .bind(last_error)
        .bind(patch.external_id)
        .bind(patch.external_url)
        .bind(patch.scheduled_at)
        .fetch_optional(&mut *tx)
        .await?;

        let job = match row {
            Some(r) => job_from_row(&r)?,
            None => {
                // Nothing matched: tell a missing job apart from a lost race.
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM scheduled_jobs WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?;
                return match current {
                    Some(actual) => Err(StoreError::Conflict {
                        id,
                        expected,
                        actual: parse_status(&actual)?,
                    }),
                    None => Err(StoreError::NotFound(id)),
                };
            }
        };

        if expected != new {
            sqlx::query(
                r#"
                INSERT INTO job_transitions (job_id, from_status, to_status, at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(expected.to_string())
            .bind(new.to_string())
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(job)
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM scheduled_jobs
            WHERE status = ANY($1)
            ORDER BY scheduled_at ASC, id ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(status_names(statuses))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn recent_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM scheduled_jobs
            WHERE status = $1
            ORDER BY updated_at DESC, id ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(status.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM scheduled_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| -> Result<(JobStatus, i64), StoreError> {
                let status: String = r.try_get("status")?;
                Ok((parse_status(&status)?, r.try_get("n")?))
            })
            .collect()
    }

    async fn history(&self, id: Uuid) -> Result<Vec<StatusTransition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, from_status, to_status, at
            FROM job_transitions
            WHERE job_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            // Every stored job has at least its creation entry.
            return Err(StoreError::NotFound(id));
        }

        rows.iter()
            .map(|r| -> Result<StatusTransition, StoreError> {
                let from: Option<String> = r.try_get("from_status")?;
                let to: String = r.try_get("to_status")?;
                Ok(StatusTransition {
                    job_id: r.try_get("job_id")?,
                    from_status: from.as_deref().map(parse_status).transpose()?,
                    to_status: parse_status(&to)?,
                    at: r.try_get("at")?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
