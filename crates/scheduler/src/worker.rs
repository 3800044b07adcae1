//! Polling workers that drain the schedule job queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use demandplan_core::config::DistributionConfig;
use demandplan_core::domain::schedule_job::{JobStatus, ScheduleJob};
use demandplan_core::errors::{DemandError, DomainError};
use demandplan_core::job_engine::{JobStateMachine, JobTransitionError};
use demandplan_db::ScheduleJobRepository;

use crate::handler::JobHandler;

/// Counters for one pass over the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
    pub conflicts: usize,
}

/// Source of the current time for claim and finish stamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct JobWorker {
    worker_id: String,
    jobs: Arc<dyn ScheduleJobRepository>,
    handler: Arc<JobHandler>,
    state_machine: JobStateMachine,
    distribution: DistributionConfig,
    batch_size: u32,
    clock: Clock,
}

impl JobWorker {
    pub fn new(
        worker_id: impl Into<String>,
        jobs: Arc<dyn ScheduleJobRepository>,
        handler: Arc<JobHandler>,
        state_machine: JobStateMachine,
        distribution: DistributionConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            jobs,
            handler,
            state_machine,
            distribution,
            batch_size: 10,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Current time, never earlier than the tick that selected the job.
    fn stamp(&self, tick: DateTime<Utc>) -> DateTime<Utc> {
        tick.max((self.clock)())
    }

    /// Claims and executes every job available at `now`, up to the batch size.
    /// Each claim and each finish is stamped when it happens, so a slow job
    /// does not leave later claims looking older than they are.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickReport, DemandError> {
        let mut report = TickReport::default();
        let candidates = self.jobs.list_claimable(now, self.batch_size).await?;

        for job in candidates {
            let expected = job.state_version;
            let claimed_at = self.stamp(now);
            let claim = self.state_machine.claim_job(job, self.worker_id.as_str(), claimed_at);
            let claimed = match claim {
                Ok(claimed) => claimed,
                Err(error) => {
                    debug!(
                        event_name = "demand.job.claim_skipped",
                        worker_id = %self.worker_id,
                        error = %error,
                        "job could not be claimed"
                    );
                    report.conflicts += 1;
                    continue;
                }
            };
            if !self.jobs.compare_and_set(&claimed, expected).await? {
                report.conflicts += 1;
                continue;
            }
            report.claimed += 1;
            self.execute(claimed.job, now, &mut report).await?;
        }

        Ok(report)
    }

    async fn execute(
        &self,
        job: ScheduleJob,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), DemandError> {
        let today = self.distribution.today(self.stamp(now));
        let expected = job.state_version;
        let job_id = job.id.clone();
        let correlation_id = job.correlation_id.clone();

        let outcome = self.handler.handle(&job, today).await;
        let finished_at = self.stamp(now);
        let finished = match &outcome {
            Ok(_) => self.state_machine.complete_job(job, finished_at),
            Err(error) => self.state_machine.fail_job(job, error, finished_at),
        }
        .map_err(transition_error)?;

        if !self.jobs.compare_and_set(&finished, expected).await? {
            warn!(
                event_name = "demand.job.finish_conflict",
                correlation_id = %correlation_id,
                job_id = %job_id,
                worker_id = %self.worker_id,
                "job changed while it was running; result not recorded"
            );
            report.conflicts += 1;
            return Ok(());
        }

        match (&outcome, finished.job.status) {
            (Ok(outcome), _) => {
                report.processed += 1;
                info!(
                    event_name = "demand.job.processed",
                    correlation_id = %correlation_id,
                    job_id = %job_id,
                    job_type = %finished.job.job_type,
                    worker_id = %self.worker_id,
                    outcome = ?outcome,
                    "job processed"
                );
            }
            (Err(error), JobStatus::Unprocessed) => {
                report.retried += 1;
                warn!(
                    event_name = "demand.job.retry_scheduled",
                    correlation_id = %correlation_id,
                    job_id = %job_id,
                    retry_count = finished.job.retry_count,
                    available_at = %finished.job.available_at,
                    error_class = error.error_class(),
                    error = %error,
                    "job failed and will be retried"
                );
            }
            (Err(error), _) => {
                report.failed += 1;
                warn!(
                    event_name = "demand.job.failed",
                    correlation_id = %correlation_id,
                    job_id = %job_id,
                    retry_count = finished.job.retry_count,
                    error_class = finished.job.last_error_class.as_deref().unwrap_or("unknown"),
                    error = %error,
                    "job failed permanently"
                );
            }
        }
        Ok(())
    }

    /// Returns abandoned `processing` claims to the queue.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize, DemandError> {
        release_stale_claims(self.jobs.as_ref(), &self.state_machine, now, self.batch_size).await
    }
}

/// Releases `processing` jobs whose claim expired, leaving their retry budget
/// untouched. Returns how many were released.
pub async fn release_stale_claims(
    jobs: &dyn ScheduleJobRepository,
    state_machine: &JobStateMachine,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<usize, DemandError> {
    let processing = jobs.list_by_status(JobStatus::Processing, limit).await?;
    let mut released = 0;

    for job in state_machine.find_stale(processing, now) {
        let expected = job.state_version;
        let previous_worker = job.claimed_by.clone();
        let result = state_machine.release_stale(job, now).map_err(transition_error)?;
        if jobs.compare_and_set(&result, expected).await? {
            released += 1;
            info!(
                event_name = "demand.job.claim_released",
                correlation_id = %result.job.correlation_id,
                job_id = %result.job.id,
                previous_worker = previous_worker.as_deref().unwrap_or("unknown"),
                "stale claim released"
            );
        }
    }

    Ok(released)
}

fn transition_error(error: JobTransitionError) -> DemandError {
    DemandError::Domain(DomainError::InvariantViolation(error.to_string()))
}

/// A set of workers polling the queue until shutdown is signalled.
pub struct WorkerPool {
    workers: Vec<JobWorker>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(workers: Vec<JobWorker>, poll_interval: Duration) -> Self {
        Self { workers, poll_interval }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawns one task per worker. Each task stops once `shutdown` flips to
    /// `true` or its sender is dropped, finishing the job it is running first.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let poll_interval = self.poll_interval;
        self.workers
            .into_iter()
            .map(|worker| tokio::spawn(poll(worker, poll_interval, shutdown.clone())))
            .collect()
    }
}

async fn poll(worker: JobWorker, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(
        event_name = "demand.worker.started",
        worker_id = %worker.worker_id(),
        poll_interval_ms = poll_interval.as_millis() as u64,
        "job worker started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        if let Err(error) = worker.recover_stale(now).await {
            warn!(
                event_name = "demand.worker.recover_failed",
                worker_id = %worker.worker_id(),
                error = %error,
                "stale claim recovery failed"
            );
        }

        match worker.run_once(now).await {
            Ok(report) if report.claimed > 0 => {
                debug!(
                    event_name = "demand.worker.tick",
                    worker_id = %worker.worker_id(),
                    claimed = report.claimed,
                    processed = report.processed,
                    retried = report.retried,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    "worker tick finished"
                );
                continue;
            }
            Ok(_) => {}
            Err(error) => warn!(
                event_name = "demand.worker.tick_failed",
                worker_id = %worker.worker_id(),
                error = %error,
                "worker tick failed"
            ),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    info!(
        event_name = "demand.worker.stopped",
        worker_id = %worker.worker_id(),
        "job worker stopped"
    );
}
