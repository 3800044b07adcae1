use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use demandplan_core::domain::classification::{ClassificationMap, GroupBy, GroupPath};
use demandplan_core::domain::daily::{DailyForecast, DailyForecastId, DailyPlan};
use demandplan_core::domain::demand::{
    AggregateRef, AuditStamp, DemandLevel, DemandScope, GroupDemand, GroupDemandId, SkuDemand,
    SkuDemandId,
};
use demandplan_core::domain::month::MonthOfYear;
use demandplan_core::domain::schedule_job::{
    JobStatus, JobTransitionEvent, ScheduleJob, ScheduleJobId,
};
use demandplan_core::job_engine::TransitionResult;
use demandplan_core::rollup::DemandSnapshot;

use super::{
    ClassificationIndex, DemandChangeSet, DemandStore, DemandUnitOfWork, RepositoryError,
    ScheduleJobRepository,
};

#[derive(Default)]
struct JobTables {
    jobs: HashMap<String, ScheduleJob>,
    transitions: Vec<JobTransitionEvent>,
}

#[derive(Default)]
pub struct InMemoryScheduleJobRepository {
    tables: RwLock<JobTables>,
}

impl InMemoryScheduleJobRepository {
    async fn insert_all(&self, created: &[TransitionResult]) {
        let mut tables = self.tables.write().await;
        for result in created {
            tables.jobs.insert(result.job.id.0.clone(), result.job.clone());
            tables.transitions.push(result.transition.clone());
        }
    }
}

#[async_trait::async_trait]
impl ScheduleJobRepository for InMemoryScheduleJobRepository {
    async fn insert(&self, created: &TransitionResult) -> Result<(), RepositoryError> {
        self.insert_all(std::slice::from_ref(created)).await;
        Ok(())
    }

    async fn find_by_id(&self, id: &ScheduleJobId) -> Result<Option<ScheduleJob>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.get(&id.0).cloned())
    }

    async fn list_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduleJob>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<ScheduleJob> = tables
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Unprocessed && job.available_at <= now)
            .cloned()
            .collect();
        jobs.sort_by(|left, right| {
            left.available_at.cmp(&right.available_at).then(left.created_at.cmp(&right.created_at))
        });
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<ScheduleJob>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<ScheduleJob> =
            tables.jobs.values().filter(|job| job.status == status).cloned().collect();
        jobs.sort_by(|left, right| {
            left.updated_at.cmp(&right.updated_at).then(left.created_at.cmp(&right.created_at))
        });
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn compare_and_set(
        &self,
        result: &TransitionResult,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.jobs.get(&result.job.id.0) {
            Some(stored) if stored.state_version == expected_version => {}
            _ => return Ok(false),
        }
        tables.jobs.insert(result.job.id.0.clone(), result.job.clone());
        tables.transitions.push(result.transition.clone());
        Ok(true)
    }

    async fn list_transitions(
        &self,
        job_id: &ScheduleJobId,
    ) -> Result<Vec<JobTransitionEvent>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.transitions.iter().filter(|event| &event.job_id == job_id).cloned().collect())
    }
}

#[derive(Default)]
struct DemandTables {
    skus: HashMap<String, SkuDemand>,
    groups: HashMap<String, GroupDemand>,
    daily: BTreeMap<(DemandLevel, String, u32), DailyForecast>,
}

impl DemandTables {
    fn snapshot(&self, scope: DemandScope) -> DemandSnapshot {
        let in_scope = |seller_id: i64, month: MonthOfYear| {
            seller_id == scope.seller_id && month == scope.month
        };
        let skus =
            self.skus.values().filter(|row| in_scope(row.seller_id, row.month)).cloned().collect();
        let groups =
            self.groups.values().filter(|row| in_scope(row.seller_id, row.month)).cloned().collect();
        DemandSnapshot::new(scope, skus, groups)
    }

    fn daily_for(&self, parent: &AggregateRef) -> Vec<DailyForecast> {
        self.daily
            .iter()
            .filter(|((level, parent_id, _), _)| {
                *level == parent.level() && parent_id == parent.id()
            })
            .map(|(_, row)| row.clone())
            .collect()
    }

    fn apply_plan(&mut self, plan: &DailyPlan, stamp: &AuditStamp) {
        let level = plan.parent.level();
        let parent_id = plan.parent.id().to_owned();

        if let Some(from_day) = plan.clear_from_day {
            self.daily.retain(|(row_level, row_parent, day), _| {
                !(*row_level == level && *row_parent == parent_id && *day >= from_day)
            });
        }

        for day in &plan.days {
            let key = (level, parent_id.clone(), day.day);
            match self.daily.get_mut(&key) {
                Some(row) => {
                    row.forecast = day.forecast;
                    row.updated_by = stamp.actor.clone();
                    row.updated_at = stamp.at;
                }
                None => {
                    self.daily.insert(
                        key,
                        DailyForecast {
                            id: DailyForecastId::generate(),
                            parent: plan.parent.clone(),
                            seller_id: plan.seller_id,
                            month: plan.month,
                            day: day.day,
                            forecast: day.forecast,
                            updated_by: stamp.actor.clone(),
                            created_at: stamp.at,
                            updated_at: stamp.at,
                        },
                    );
                }
            }
        }
    }
}

/// Store used by tests and single-process tooling. One mutex guards every
/// scope, so units of work run strictly one after another.
pub struct InMemoryDemandStore {
    tables: Arc<Mutex<DemandTables>>,
    jobs: Arc<InMemoryScheduleJobRepository>,
}

impl InMemoryDemandStore {
    pub fn new(jobs: Arc<InMemoryScheduleJobRepository>) -> Self {
        Self { tables: Arc::new(Mutex::new(DemandTables::default())), jobs }
    }

    pub fn jobs(&self) -> Arc<InMemoryScheduleJobRepository> {
        Arc::clone(&self.jobs)
    }
}

impl Default for InMemoryDemandStore {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryScheduleJobRepository::default()))
    }
}

#[async_trait::async_trait]
impl DemandStore for InMemoryDemandStore {
    async fn begin(&self, scope: DemandScope) -> Result<Box<dyn DemandUnitOfWork>, RepositoryError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        Ok(Box::new(InMemoryUnitOfWork { scope, tables: guard, jobs: Arc::clone(&self.jobs) }))
    }

    async fn find_sku_demand(&self, id: &SkuDemandId) -> Result<Option<SkuDemand>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.skus.get(&id.0).cloned())
    }

    async fn find_group_demand(
        &self,
        id: &GroupDemandId,
    ) -> Result<Option<GroupDemand>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.groups.get(&id.0).cloned())
    }

    async fn list_sku_demands(&self, scope: DemandScope) -> Result<Vec<SkuDemand>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.snapshot(scope).sku_rows().cloned().collect())
    }

    async fn list_group_demands(
        &self,
        scope: DemandScope,
    ) -> Result<Vec<GroupDemand>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.snapshot(scope).group_rows().cloned().collect())
    }

    async fn list_daily_forecasts(
        &self,
        parent: &AggregateRef,
    ) -> Result<Vec<DailyForecast>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.daily_for(parent))
    }

    async fn find_daily_forecast(
        &self,
        level: DemandLevel,
        id: &DailyForecastId,
    ) -> Result<Option<DailyForecast>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .daily
            .iter()
            .find(|((row_level, _, _), row)| *row_level == level && &row.id == id)
            .map(|(_, row)| row.clone()))
    }
}

struct InMemoryUnitOfWork {
    scope: DemandScope,
    tables: OwnedMutexGuard<DemandTables>,
    jobs: Arc<InMemoryScheduleJobRepository>,
}

#[async_trait::async_trait]
impl DemandUnitOfWork for InMemoryUnitOfWork {
    fn scope(&self) -> DemandScope {
        self.scope
    }

    async fn load_snapshot(&mut self) -> Result<DemandSnapshot, RepositoryError> {
        Ok(self.tables.snapshot(self.scope))
    }

    async fn daily_forecasts(
        &mut self,
        parent: &AggregateRef,
    ) -> Result<Vec<DailyForecast>, RepositoryError> {
        Ok(self.tables.daily_for(parent))
    }

    async fn commit(self: Box<Self>, changes: DemandChangeSet) -> Result<(), RepositoryError> {
        let InMemoryUnitOfWork { mut tables, jobs, .. } = *self;

        for row in changes.skus {
            tables.skus.insert(row.id.0.clone(), row);
        }
        for row in changes.groups {
            tables.groups.insert(row.id.0.clone(), row);
        }
        for plan in &changes.daily_plans {
            tables.apply_plan(plan, &changes.stamp);
        }
        jobs.insert_all(&changes.jobs).await;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryClassificationIndex {
    skus: RwLock<BTreeMap<DemandScope, ClassificationMap>>,
    groups: RwLock<BTreeMap<(DemandScope, GroupBy), BTreeSet<GroupPath>>>,
}

impl InMemoryClassificationIndex {
    pub async fn record_sku_path(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
        sku: &str,
        path: GroupPath,
    ) {
        let mut skus = self.skus.write().await;
        let entry = skus.entry(scope).or_default().entry(sku.to_owned()).or_default();
        match group_by {
            GroupBy::Category => entry.category = Some(path),
            GroupBy::Segment => entry.segment = Some(path),
        }
    }

    pub async fn record_group_path(&self, scope: DemandScope, group_by: GroupBy, path: GroupPath) {
        let mut groups = self.groups.write().await;
        groups.entry((scope, group_by)).or_default().insert(path);
    }
}

#[async_trait::async_trait]
impl ClassificationIndex for InMemoryClassificationIndex {
    async fn resolve_category_path(
        &self,
        scope: DemandScope,
        sku: &str,
    ) -> Result<Option<GroupPath>, RepositoryError> {
        let skus = self.skus.read().await;
        Ok(skus.get(&scope).and_then(|map| map.get(sku)).and_then(|entry| entry.category.clone()))
    }

    async fn resolve_segment_path(
        &self,
        scope: DemandScope,
        sku: &str,
    ) -> Result<Option<GroupPath>, RepositoryError> {
        let skus = self.skus.read().await;
        Ok(skus.get(&scope).and_then(|map| map.get(sku)).and_then(|entry| entry.segment.clone()))
    }

    async fn resolve_month(&self, scope: DemandScope) -> Result<ClassificationMap, RepositoryError> {
        let skus = self.skus.read().await;
        Ok(skus.get(&scope).cloned().unwrap_or_default())
    }

    async fn valid_group_paths(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
    ) -> Result<Vec<GroupPath>, RepositoryError> {
        let groups = self.groups.read().await;
        Ok(groups.get(&(scope, group_by)).map(|paths| paths.iter().cloned().collect()).unwrap_or_default())
    }
}
