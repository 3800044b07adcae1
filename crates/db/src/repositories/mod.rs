use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use demandplan_core::domain::classification::{ClassificationMap, GroupBy, GroupPath};
use demandplan_core::domain::daily::{DailyForecast, DailyForecastId, DailyPlan};
use demandplan_core::domain::demand::{
    AggregateRef, AuditStamp, DemandLevel, DemandScope, GroupDemand, GroupDemandId, SkuDemand,
    SkuDemandId,
};
use demandplan_core::domain::schedule_job::{JobStatus, JobTransitionEvent, ScheduleJob, ScheduleJobId};
use demandplan_core::errors::{ApplicationError, DemandError};
use demandplan_core::job_engine::TransitionResult;
use demandplan_core::rollup::{DemandSnapshot, SnapshotChanges};

pub mod classification;
mod codec;
pub mod demand;
pub mod memory;
pub mod schedule_job;

pub use classification::SqlClassificationIndex;
pub use demand::SqlDemandStore;
pub use memory::{InMemoryClassificationIndex, InMemoryDemandStore, InMemoryScheduleJobRepository};
pub use schedule_job::SqlScheduleJobRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for DemandError {
    fn from(error: RepositoryError) -> Self {
        DemandError::Storage(error.to_string())
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::from(DemandError::from(error))
    }
}

/// Everything one job writes for a (seller, month) scope. Applied atomically by
/// [`DemandUnitOfWork::commit`].
#[derive(Clone, Debug)]
pub struct DemandChangeSet {
    pub stamp: AuditStamp,
    pub skus: Vec<SkuDemand>,
    pub groups: Vec<GroupDemand>,
    pub daily_plans: Vec<DailyPlan>,
    pub jobs: Vec<TransitionResult>,
}

impl DemandChangeSet {
    pub fn new(stamp: AuditStamp) -> Self {
        Self { stamp, skus: Vec::new(), groups: Vec::new(), daily_plans: Vec::new(), jobs: Vec::new() }
    }

    pub fn from_snapshot(changes: SnapshotChanges, stamp: AuditStamp) -> Self {
        Self { skus: changes.skus, groups: changes.groups, ..Self::new(stamp) }
    }

    pub fn is_empty(&self) -> bool {
        self.skus.is_empty()
            && self.groups.is_empty()
            && self.daily_plans.is_empty()
            && self.jobs.is_empty()
    }
}

#[async_trait]
pub trait DemandStore: Send + Sync {
    /// Opens a write scope for one (seller, month). Concurrent units of work on
    /// the same scope are serialized until the holder commits or is dropped.
    async fn begin(&self, scope: DemandScope) -> Result<Box<dyn DemandUnitOfWork>, RepositoryError>;

    async fn find_sku_demand(&self, id: &SkuDemandId) -> Result<Option<SkuDemand>, RepositoryError>;

    async fn find_group_demand(
        &self,
        id: &GroupDemandId,
    ) -> Result<Option<GroupDemand>, RepositoryError>;

    async fn list_sku_demands(&self, scope: DemandScope) -> Result<Vec<SkuDemand>, RepositoryError>;

    async fn list_group_demands(
        &self,
        scope: DemandScope,
    ) -> Result<Vec<GroupDemand>, RepositoryError>;

    /// Daily rows of one aggregate, ordered by day.
    async fn list_daily_forecasts(
        &self,
        parent: &AggregateRef,
    ) -> Result<Vec<DailyForecast>, RepositoryError>;

    async fn find_daily_forecast(
        &self,
        level: DemandLevel,
        id: &DailyForecastId,
    ) -> Result<Option<DailyForecast>, RepositoryError>;
}

/// Read-recompute-write session over one locked scope. Dropping it without
/// calling `commit` discards every change.
#[async_trait]
pub trait DemandUnitOfWork: Send {
    fn scope(&self) -> DemandScope;

    async fn load_snapshot(&mut self) -> Result<DemandSnapshot, RepositoryError>;

    async fn daily_forecasts(
        &mut self,
        parent: &AggregateRef,
    ) -> Result<Vec<DailyForecast>, RepositoryError>;

    async fn commit(self: Box<Self>, changes: DemandChangeSet) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ScheduleJobRepository: Send + Sync {
    /// Stores a freshly created job together with its enqueue transition.
    async fn insert(&self, created: &TransitionResult) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &ScheduleJobId) -> Result<Option<ScheduleJob>, RepositoryError>;

    /// `unprocessed` jobs whose `available_at` has passed, oldest first.
    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduleJob>, RepositoryError>;

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<ScheduleJob>, RepositoryError>;

    /// Persists `result.job` only if the stored row still carries
    /// `expected_version`, appending `result.transition` in the same write.
    /// Returns `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        result: &TransitionResult,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn list_transitions(
        &self,
        job_id: &ScheduleJobId,
    ) -> Result<Vec<JobTransitionEvent>, RepositoryError>;
}

/// Read side of the monthly SKU classification maintained by ingestion.
#[async_trait]
pub trait ClassificationIndex: Send + Sync {
    async fn resolve_category_path(
        &self,
        scope: DemandScope,
        sku: &str,
    ) -> Result<Option<GroupPath>, RepositoryError>;

    async fn resolve_segment_path(
        &self,
        scope: DemandScope,
        sku: &str,
    ) -> Result<Option<GroupPath>, RepositoryError>;

    /// Every classified SKU of the month with both of its paths.
    async fn resolve_month(&self, scope: DemandScope) -> Result<ClassificationMap, RepositoryError>;

    async fn valid_group_paths(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
    ) -> Result<Vec<GroupPath>, RepositoryError>;
}
