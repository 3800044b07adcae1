use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use demandplan_core::domain::schedule_job::{
    JobStatus, JobTransitionEvent, JobTransitionId, JobType, ScheduleJob, ScheduleJobId,
};
use demandplan_core::job_engine::TransitionResult;

use super::codec::{encode_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{RepositoryError, ScheduleJobRepository};
use crate::DbPool;

const JOB_COLUMNS: &str = "id, job_type, payload_json, seller_id, status, retry_count,
    max_retries, available_at, claimed_by, claimed_at, executed_at, last_error,
    last_error_class, state_version, correlation_id, created_at, updated_at";

pub struct SqlScheduleJobRepository {
    pool: DbPool,
}

impl SqlScheduleJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ScheduleJobRepository for SqlScheduleJobRepository {
    async fn insert(&self, created: &TransitionResult) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        insert_job(&mut tx, created).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &ScheduleJobId) -> Result<Option<ScheduleJob>, RepositoryError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM schedule_job WHERE id = ?");
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduleJob>, RepositoryError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM schedule_job
             WHERE status = 'unprocessed' AND available_at <= ?
             ORDER BY available_at ASC, created_at ASC
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(encode_timestamp(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<ScheduleJob>, RepositoryError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM schedule_job
             WHERE status = ?
             ORDER BY updated_at ASC, created_at ASC
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn compare_and_set(
        &self,
        result: &TransitionResult,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let job = &result.job;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE schedule_job SET
                status = ?,
                retry_count = ?,
                max_retries = ?,
                available_at = ?,
                claimed_by = ?,
                claimed_at = ?,
                executed_at = ?,
                last_error = ?,
                last_error_class = ?,
                state_version = ?,
                updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.retry_count))
        .bind(i64::from(job.max_retries))
        .bind(encode_timestamp(job.available_at))
        .bind(job.claimed_by.as_deref())
        .bind(job.claimed_at.map(encode_timestamp))
        .bind(job.executed_at.map(encode_timestamp))
        .bind(job.last_error.as_deref())
        .bind(job.last_error_class.as_deref())
        .bind(i64::from(job.state_version))
        .bind(encode_timestamp(job.updated_at))
        .bind(&job.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        insert_transition(&mut tx, &result.transition).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_transitions(
        &self,
        job_id: &ScheduleJobId,
    ) -> Result<Vec<JobTransitionEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                job_id,
                from_status,
                to_status,
                transition_reason,
                error_class,
                decision_context_json,
                actor_type,
                actor_id,
                correlation_id,
                state_version,
                occurred_at
             FROM schedule_job_transition
             WHERE job_id = ?
             ORDER BY state_version ASC, occurred_at ASC",
        )
        .bind(&job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transition_from_row).collect()
    }
}

/// Inserts a new job and its enqueue transition on an open connection, so
/// callers can enqueue inside a larger transaction.
pub(crate) async fn insert_job(
    conn: &mut SqliteConnection,
    created: &TransitionResult,
) -> Result<(), RepositoryError> {
    let job = &created.job;
    sqlx::query(
        "INSERT INTO schedule_job (
            id,
            job_type,
            payload_json,
            seller_id,
            status,
            retry_count,
            max_retries,
            available_at,
            claimed_by,
            claimed_at,
            executed_at,
            last_error,
            last_error_class,
            state_version,
            correlation_id,
            created_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(job.id.0.clone())
    .bind(job.job_type.as_str())
    .bind(job.payload_json.clone())
    .bind(job.seller_id)
    .bind(job.status.as_str())
    .bind(i64::from(job.retry_count))
    .bind(i64::from(job.max_retries))
    .bind(encode_timestamp(job.available_at))
    .bind(job.claimed_by.clone())
    .bind(job.claimed_at.map(encode_timestamp))
    .bind(job.executed_at.map(encode_timestamp))
    .bind(job.last_error.clone())
    .bind(job.last_error_class.clone())
    .bind(i64::from(job.state_version))
    .bind(job.correlation_id.clone())
    .bind(encode_timestamp(job.created_at))
    .bind(encode_timestamp(job.updated_at))
    .execute(&mut *conn)
    .await?;

    insert_transition(conn, &created.transition).await
}

async fn insert_transition(
    conn: &mut SqliteConnection,
    transition: &JobTransitionEvent,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO schedule_job_transition (
            id,
            job_id,
            from_status,
            to_status,
            transition_reason,
            error_class,
            decision_context_json,
            actor_type,
            actor_id,
            correlation_id,
            state_version,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(transition.id.0.clone())
    .bind(transition.job_id.0.clone())
    .bind(transition.from_status.as_ref().map(JobStatus::as_str))
    .bind(transition.to_status.as_str())
    .bind(transition.transition_reason.clone())
    .bind(transition.error_class.clone())
    .bind(transition.decision_context_json.clone())
    .bind(transition.actor_type.clone())
    .bind(transition.actor_id.clone())
    .bind(transition.correlation_id.clone())
    .bind(i64::from(transition.state_version))
    .bind(encode_timestamp(transition.occurred_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<ScheduleJob, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job status `{status_raw}`")))?;
    let job_type_raw = row.try_get::<String, _>("job_type")?;
    let job_type = JobType::parse(&job_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown job type `{job_type_raw}`")))?;

    Ok(ScheduleJob {
        id: ScheduleJobId(row.try_get("id")?),
        job_type,
        payload_json: row.try_get("payload_json")?,
        seller_id: row.try_get("seller_id")?,
        status,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        max_retries: parse_u32("max_retries", row.try_get("max_retries")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        executed_at: parse_optional_timestamp("executed_at", row.try_get("executed_at")?)?,
        last_error: row.try_get("last_error")?,
        last_error_class: row.try_get("last_error_class")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn transition_from_row(row: &SqliteRow) -> Result<JobTransitionEvent, RepositoryError> {
    let from_status = row
        .try_get::<Option<String>, _>("from_status")?
        .map(|value| {
            JobStatus::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown from_status `{value}`")))
        })
        .transpose()?;

    let to_status_raw = row.try_get::<String, _>("to_status")?;
    let to_status = JobStatus::parse(&to_status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown to_status `{to_status_raw}`")))?;

    Ok(JobTransitionEvent {
        id: JobTransitionId(row.try_get("id")?),
        job_id: ScheduleJobId(row.try_get("job_id")?),
        from_status,
        to_status,
        transition_reason: row.try_get("transition_reason")?,
        error_class: row.try_get("error_class")?,
        decision_context_json: row.try_get("decision_context_json")?,
        actor_type: row.try_get("actor_type")?,
        actor_id: row.try_get("actor_id")?,
        correlation_id: row.try_get("correlation_id")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
