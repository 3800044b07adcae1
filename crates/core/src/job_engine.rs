//! Schedule job state machine
//!
//! Pure transition logic for the durable job queue. Every transition bumps
//! `state_version` and yields an audit event; persistence layers apply the
//! result with a compare-and-set on the previous version.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::schedule_job::{
    JobPayload, JobStatus, JobTransitionEvent, JobTransitionId, ScheduleJob, ScheduleJobId,
};
use crate::errors::DemandError;

/// Configuration for the job state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobEngineConfig {
    /// How long before a claimed job is considered abandoned
    pub claim_timeout_seconds: i64,
    /// Max retries for jobs enqueued without an explicit value
    pub default_max_retries: u32,
    /// Backoff multiplier for retries
    pub retry_backoff_multiplier: u32,
    /// Base delay in seconds between retries
    pub retry_base_delay_seconds: i64,
    /// Upper bound for a single backoff delay
    pub retry_max_delay_seconds: i64,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 300,
            default_max_retries: 3,
            retry_backoff_multiplier: 2,
            retry_base_delay_seconds: 5,
            retry_max_delay_seconds: 3600,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobTransitionError {
    #[error("invalid job transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: JobStatus, to: JobStatus, reason: String },
    #[error("claim conflict: job {0} already claimed by {1}")]
    ClaimConflict(ScheduleJobId, String),
    #[error("job not yet available: {0}")]
    NotYetAvailable(ScheduleJobId),
}

/// Job after a transition plus the audit event describing it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionResult {
    pub job: ScheduleJob,
    pub transition: JobTransitionEvent,
}

/// Policy for handling failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Return to the queue with exponential backoff
    Retry,
    /// Mark as failed, no more retries
    FailTerminal,
}

#[derive(Clone, Debug, Default)]
pub struct JobStateMachine {
    config: JobEngineConfig,
}

impl JobStateMachine {
    pub fn new() -> Self {
        Self::with_config(JobEngineConfig::default())
    }

    pub fn with_config(config: JobEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JobEngineConfig {
        &self.config
    }

    /// Creates an `unprocessed` job for a validated payload.
    pub fn create_job(
        &self,
        payload: &JobPayload,
        max_retries: Option<u32>,
        correlation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DemandError> {
        payload.validate()?;
        let correlation_id = correlation_id.into();
        let job = ScheduleJob {
            id: ScheduleJobId(Uuid::new_v4().to_string()),
            job_type: payload.job_type(),
            payload_json: payload.encode()?,
            seller_id: payload.scope().seller_id,
            status: JobStatus::Unprocessed,
            retry_count: 0,
            max_retries: max_retries.unwrap_or(self.config.default_max_retries),
            available_at: now,
            claimed_by: None,
            claimed_at: None,
            executed_at: None,
            last_error: None,
            last_error_class: None,
            state_version: 1,
            correlation_id: correlation_id.clone(),
            created_at: now,
            updated_at: now,
        };

        let transition = self.transition_event(
            &job,
            None,
            "job_enqueued",
            None,
            serde_json::json!({
                "job_type": job.job_type.as_str(),
                "max_retries": job.max_retries,
            }),
            ("api", payload.updated_by()),
            now,
        );

        Ok(TransitionResult { job, transition })
    }

    /// `unprocessed -> processing`. An abandoned `processing` claim may be stolen.
    pub fn claim_job(
        &self,
        mut job: ScheduleJob,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, JobTransitionError> {
        let worker_id = worker_id.into();

        match job.status {
            JobStatus::Unprocessed => {}
            JobStatus::Processing => {
                if !self.is_claim_stale(&job, now) {
                    return Err(JobTransitionError::ClaimConflict(
                        job.id.clone(),
                        job.claimed_by.clone().unwrap_or_default(),
                    ));
                }
            }
            JobStatus::Processed | JobStatus::Failed => {
                return Err(JobTransitionError::InvalidTransition {
                    from: job.status,
                    to: JobStatus::Processing,
                    reason: "job already in terminal state".to_string(),
                });
            }
        }

        if now < job.available_at {
            return Err(JobTransitionError::NotYetAvailable(job.id.clone()));
        }

        let from_status = job.status;
        job.status = JobStatus::Processing;
        job.claimed_by = Some(worker_id.clone());
        job.claimed_at = Some(now);
        job.state_version += 1;
        job.updated_at = now;

        let transition = self.transition_event(
            &job,
            Some(from_status),
            "job_claimed",
            None,
            serde_json::json!({
                "worker_id": worker_id,
                "claim_timeout_seconds": self.config.claim_timeout_seconds,
            }),
            ("worker", worker_id.as_str()),
            now,
        );

        Ok(TransitionResult { job, transition })
    }

    /// `processing -> processed`.
    pub fn complete_job(
        &self,
        mut job: ScheduleJob,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, JobTransitionError> {
        self.validate_transition(&job, JobStatus::Processed)?;

        let from_status = job.status;
        let worker_id = job.claimed_by.take().unwrap_or_else(|| "system".to_string());
        job.status = JobStatus::Processed;
        job.claimed_at = None;
        job.executed_at = Some(now);
        job.state_version += 1;
        job.updated_at = now;

        let transition = self.transition_event(
            &job,
            Some(from_status),
            "job_processed",
            None,
            serde_json::json!({ "retry_count": job.retry_count }),
            ("worker", worker_id.as_str()),
            now,
        );

        Ok(TransitionResult { job, transition })
    }

    /// `processing -> unprocessed` (retry with backoff) or `processing -> failed`.
    pub fn fail_job(
        &self,
        mut job: ScheduleJob,
        error: &DemandError,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, JobTransitionError> {
        let retryable = error.retry_policy() == RetryPolicy::Retry;
        let should_retry = retryable && job.retry_count < job.max_retries;
        let target = if should_retry { JobStatus::Unprocessed } else { JobStatus::Failed };
        self.validate_transition(&job, target)?;

        let from_status = job.status;
        let worker_id = job.claimed_by.take().unwrap_or_else(|| "system".to_string());
        job.claimed_at = None;
        job.executed_at = Some(now);
        job.state_version += 1;
        job.updated_at = now;

        if should_retry {
            let available_at = now + Duration::seconds(self.backoff_seconds(job.retry_count));
            job.status = JobStatus::Unprocessed;
            job.retry_count += 1;
            job.available_at = available_at;
            job.last_error = Some(error.to_string());
            job.last_error_class = Some(error.error_class().to_string());

            let transition = self.transition_event(
                &job,
                Some(from_status),
                "job_failed_retryable",
                Some(error.error_class()),
                serde_json::json!({
                    "retry_count": job.retry_count,
                    "max_retries": job.max_retries,
                    "next_available_at": available_at,
                    "error": error.to_string(),
                }),
                ("worker", worker_id.as_str()),
                now,
            );
            return Ok(TransitionResult { job, transition });
        }

        let terminal = if retryable {
            DemandError::MaxRetriesExceeded {
                retries: job.retry_count,
                last_error: error.to_string(),
            }
        } else {
            error.clone()
        };
        job.status = JobStatus::Failed;
        job.last_error = Some(terminal.to_string());
        job.last_error_class = Some(terminal.error_class().to_string());

        let transition = self.transition_event(
            &job,
            Some(from_status),
            "job_failed_terminal",
            Some(terminal.error_class()),
            serde_json::json!({
                "retry_count": job.retry_count,
                "max_retries": job.max_retries,
                "error": error.to_string(),
                "cause_class": error.error_class(),
            }),
            ("worker", worker_id.as_str()),
            now,
        );
        Ok(TransitionResult { job, transition })
    }

    /// Returns the `processing` jobs whose claim has expired.
    pub fn find_stale(&self, jobs: Vec<ScheduleJob>, reference_time: DateTime<Utc>) -> Vec<ScheduleJob> {
        jobs.into_iter()
            .filter(|job| {
                matches!(job.status, JobStatus::Processing) && self.is_claim_stale(job, reference_time)
            })
            .collect()
    }

    /// `processing -> unprocessed` for an abandoned claim; the retry budget is untouched.
    pub fn release_stale(
        &self,
        mut job: ScheduleJob,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, JobTransitionError> {
        if job.status != JobStatus::Processing || !self.is_claim_stale(&job, now) {
            return Err(JobTransitionError::InvalidTransition {
                from: job.status,
                to: JobStatus::Unprocessed,
                reason: "only expired processing claims can be released".to_string(),
            });
        }

        let from_status = job.status;
        let previous_worker = job.claimed_by.take();
        let claimed_at = job.claimed_at.take();
        job.status = JobStatus::Unprocessed;
        job.available_at = now;
        job.state_version += 1;
        job.updated_at = now;

        let transition = self.transition_event(
            &job,
            Some(from_status),
            "claim_expired",
            None,
            serde_json::json!({
                "previous_worker": previous_worker,
                "claimed_at": claimed_at,
                "claim_timeout_seconds": self.config.claim_timeout_seconds,
            }),
            ("system", "stale_recovery"),
            now,
        );

        Ok(TransitionResult { job, transition })
    }

    fn is_claim_stale(&self, job: &ScheduleJob, now: DateTime<Utc>) -> bool {
        job.claimed_at.map_or(true, |claimed_at| {
            now >= claimed_at + Duration::seconds(self.config.claim_timeout_seconds)
        })
    }

    fn backoff_seconds(&self, retry_count: u32) -> i64 {
        let factor = i64::from(self.config.retry_backoff_multiplier.saturating_pow(retry_count));
        self.config
            .retry_base_delay_seconds
            .saturating_mul(factor)
            .clamp(0, self.config.retry_max_delay_seconds.max(0))
    }

    fn validate_transition(
        &self,
        job: &ScheduleJob,
        to_status: JobStatus,
    ) -> Result<(), JobTransitionError> {
        let valid = matches!(
            (job.status, to_status),
            (JobStatus::Processing, JobStatus::Processed)
                | (JobStatus::Processing, JobStatus::Unprocessed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Unprocessed, JobStatus::Processing)
        );

        if valid {
            Ok(())
        } else {
            Err(JobTransitionError::InvalidTransition {
                from: job.status,
                to: to_status,
                reason: format!("cannot transition from {:?} to {:?}", job.status, to_status),
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn transition_event(
        &self,
        job: &ScheduleJob,
        from_status: Option<JobStatus>,
        reason: &str,
        error_class: Option<&str>,
        decision_context: serde_json::Value,
        (actor_type, actor_id): (&str, &str),
        now: DateTime<Utc>,
    ) -> JobTransitionEvent {
        JobTransitionEvent {
            id: JobTransitionId(Uuid::new_v4().to_string()),
            job_id: job.id.clone(),
            from_status,
            to_status: job.status,
            transition_reason: reason.to_string(),
            error_class: error_class.map(str::to_string),
            decision_context_json: decision_context.to_string(),
            actor_type: actor_type.to_string(),
            actor_id: actor_id.to_string(),
            correlation_id: job.correlation_id.clone(),
            state_version: job.state_version,
            occurred_at: now,
        }
    }
}
