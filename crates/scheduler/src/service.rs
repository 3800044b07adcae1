//! Application service behind the HTTP and CLI entry points.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use demandplan_core::distribution::DistributionEngine;
use demandplan_core::domain::classification::{GroupBy, GroupPath};
use demandplan_core::domain::daily::{DailyForecast, DailyForecastId};
use demandplan_core::domain::demand::{
    AggregateRef, AuditStamp, DemandLevel, DemandScope, GroupDemand, GroupDemandId, MetricsPatch,
    ALL_SITES, MAX_METRIC_MAGNITUDE,
};
use demandplan_core::domain::schedule_job::{
    JobPayload, JobStatus, JobTransitionEvent, ScheduleJob, ScheduleJobId,
    UpdateAllSiteGroupDemandPayload, UpdateAllSiteSkuDemandPayload, UpdateGroupDemandPayload,
    UpdateSkuDemandPayload,
};
use demandplan_core::errors::{ApplicationError, DemandError};
use demandplan_core::job_engine::JobStateMachine;
use demandplan_core::rollup::{DemandSnapshot, RollupEngine};
use demandplan_db::{ClassificationIndex, DemandChangeSet, DemandStore, ScheduleJobRepository};

use crate::worker::release_stale_claims;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCorrection {
    pub level: DemandLevel,
    pub daily_forecast_id: DailyForecastId,
    pub forecast: Decimal,
    pub updated_by: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DailyCorrectionReceipt {
    pub parent: AggregateRef,
    pub day: u32,
    pub previous: Decimal,
    pub forecast: Decimal,
    pub parent_forecast: Decimal,
    pub job_id: ScheduleJobId,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Filter over the group rows of one (seller, month).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDemandQuery {
    pub scope: DemandScope,
    pub group_by: Option<GroupBy>,
    pub group_key: Option<GroupPath>,
    pub site_id: Option<i64>,
    pub latest_only: bool,
    pub limit: u32,
    pub offset: u32,
}

impl GroupDemandQuery {
    /// Current hierarchy of a scope, first page.
    pub fn current(scope: DemandScope) -> Self {
        Self {
            scope,
            group_by: None,
            group_key: None,
            site_id: None,
            latest_only: true,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }

    fn matches(&self, row: &GroupDemand) -> bool {
        (!self.latest_only || row.is_latest_group)
            && self.group_by.map_or(true, |group_by| row.group_by == group_by)
            && self.group_key.as_ref().map_or(true, |key| &row.group_key == key)
            && self.site_id.map_or(true, |site_id| row.site_id == site_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupDemandPage {
    pub rows: Vec<GroupDemand>,
    pub total: usize,
    pub limit: u32,
    pub offset: u32,
}

pub struct DemandPlanningService {
    store: Arc<dyn DemandStore>,
    jobs: Arc<dyn ScheduleJobRepository>,
    classification: Arc<dyn ClassificationIndex>,
    state_machine: JobStateMachine,
    rollup: RollupEngine,
    distribution: DistributionEngine,
}

impl DemandPlanningService {
    pub fn new(
        store: Arc<dyn DemandStore>,
        jobs: Arc<dyn ScheduleJobRepository>,
        classification: Arc<dyn ClassificationIndex>,
    ) -> Self {
        Self {
            store,
            jobs,
            classification,
            state_machine: JobStateMachine::new(),
            rollup: RollupEngine::default(),
            distribution: DistributionEngine::default(),
        }
    }

    pub fn with_state_machine(mut self, state_machine: JobStateMachine) -> Self {
        self.state_machine = state_machine;
        self
    }

    pub fn with_scale(mut self, scale: u32) -> Self {
        self.rollup = RollupEngine::new(scale);
        self.distribution = DistributionEngine::new(scale);
        self
    }

    /// Validates and enqueues a job as `unprocessed`.
    pub async fn submit_job(
        &self,
        payload: JobPayload,
        max_retries: Option<u32>,
        correlation_id: &str,
    ) -> Result<ScheduleJob, ApplicationError> {
        let created = self.state_machine.create_job(&payload, max_retries, correlation_id, Utc::now())?;
        self.jobs.insert(&created).await?;

        info!(
            event_name = "demand.job.enqueued",
            correlation_id = %correlation_id,
            job_id = %created.job.id,
            job_type = %created.job.job_type,
            seller_id = created.job.seller_id,
            "job enqueued"
        );
        Ok(created.job)
    }

    pub async fn job_status(&self, id: &ScheduleJobId) -> Result<ScheduleJob, ApplicationError> {
        self.jobs
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("schedule job {id}")))
    }

    pub async fn job_history(
        &self,
        id: &ScheduleJobId,
    ) -> Result<Vec<JobTransitionEvent>, ApplicationError> {
        Ok(self.jobs.list_transitions(id).await?)
    }

    pub async fn jobs_by_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<ScheduleJob>, ApplicationError> {
        Ok(self.jobs.list_by_status(status, limit).await?)
    }

    pub async fn daily_forecasts(
        &self,
        parent: &AggregateRef,
    ) -> Result<Vec<DailyForecast>, ApplicationError> {
        Ok(self.store.list_daily_forecasts(parent).await?)
    }

    /// Group rows of a scope matching `query`, ordered by (group_by, group_key, site).
    pub async fn list_group_demands(
        &self,
        query: &GroupDemandQuery,
    ) -> Result<GroupDemandPage, ApplicationError> {
        let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);
        let mut rows: Vec<GroupDemand> = self
            .store
            .list_group_demands(query.scope)
            .await?
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();
        rows.sort_by(|left, right| {
            (left.group_by, &left.group_key, left.site_id).cmp(&(
                right.group_by,
                &right.group_key,
                right.site_id,
            ))
        });

        let total = rows.len();
        let rows = rows.into_iter().skip(query.offset as usize).take(limit as usize).collect();
        Ok(GroupDemandPage { rows, total, limit, offset: query.offset })
    }

    pub async fn group_demand(&self, id: &GroupDemandId) -> Result<GroupDemand, ApplicationError> {
        self.store
            .find_group_demand(id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("group demand {}", id.0)))
    }

    /// Overwrites one open day, moves the parent total by the same amount and
    /// enqueues the parent's update job. The parent's own days stay as written;
    /// only its ancestors are rolled up and redistributed.
    pub async fn update_daily_forecast(
        &self,
        correction: DailyCorrection,
        today: NaiveDate,
        correlation_id: &str,
    ) -> Result<DailyCorrectionReceipt, ApplicationError> {
        if correction.forecast.abs() > MAX_METRIC_MAGNITUDE {
            return Err(DemandError::InvalidPayload(format!(
                "daily forecast exceeds the supported magnitude of {MAX_METRIC_MAGNITUDE}"
            ))
            .into());
        }
        let daily = self
            .store
            .find_daily_forecast(correction.level, &correction.daily_forecast_id)
            .await?
            .ok_or_else(|| {
                ApplicationError::NotFound(format!(
                    "{} daily forecast {}",
                    correction.level.as_str(),
                    correction.daily_forecast_id.0
                ))
            })?;
        self.distribution.validate_day_write(daily.month, daily.day, today)?;

        let scope = DemandScope { seller_id: daily.seller_id, month: daily.month };
        let mut uow = self.store.begin(scope).await?;
        let snapshot = uow.load_snapshot().await?;
        let (parent_total, payload_for) = parent_target(&snapshot, &daily.parent)?;
        let existing = uow.daily_forecasts(&daily.parent).await?;

        let outcome = self.distribution.correct_day(
            daily.parent.clone(),
            scope.seller_id,
            scope.month,
            &existing,
            daily.day,
            correction.forecast,
            parent_total,
            today,
        )?;

        let payload = payload_for.into_payload(
            scope,
            outcome.new_total,
            daily.parent.id().to_string(),
            correction.updated_by.clone(),
        );
        let created = self.state_machine.create_job(&payload, None, correlation_id, Utc::now())?;
        let job_id = created.job.id.clone();

        let mut changes = DemandChangeSet::new(AuditStamp::now(correction.updated_by.as_str()));
        changes.daily_plans.push(outcome.plan);
        changes.jobs.push(created);
        uow.commit(changes).await?;

        info!(
            event_name = "demand.daily.corrected",
            correlation_id = %correlation_id,
            parent = %daily.parent,
            day = daily.day,
            previous = %outcome.previous,
            forecast = %correction.forecast,
            parent_forecast = %outcome.new_total,
            job_id = %job_id,
            "daily forecast corrected"
        );

        Ok(DailyCorrectionReceipt {
            parent: daily.parent,
            day: daily.day,
            previous: outcome.previous,
            forecast: correction.forecast,
            parent_forecast: outcome.new_total,
            job_id,
        })
    }

    /// Re-derives `is_latest_group` for one hierarchy of a scope from the
    /// month's valid group paths. Returns the number of rows that flipped.
    pub async fn refresh_latest_groups(
        &self,
        scope: DemandScope,
        group_by: GroupBy,
        updated_by: &str,
    ) -> Result<usize, ApplicationError> {
        let valid_paths = self.classification.valid_group_paths(scope, group_by).await?;
        if valid_paths.is_empty() {
            return Err(DemandError::ClassificationNotFound {
                subject: format!("{group_by} hierarchy"),
                month: scope.month,
            }
            .into());
        }

        let stamp = AuditStamp::now(updated_by);
        let mut uow = self.store.begin(scope).await?;
        let mut snapshot = uow.load_snapshot().await?;
        let flipped = self.rollup.refresh_latest_groups(&mut snapshot, group_by, &valid_paths, &stamp);
        uow.commit(DemandChangeSet::from_snapshot(snapshot.changes(), stamp)).await?;

        info!(
            event_name = "demand.groups.latest_refreshed",
            seller_id = scope.seller_id,
            month_of_year = %scope.month,
            group_by = %group_by,
            flipped,
            "latest group flags refreshed"
        );
        Ok(flipped)
    }

    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<usize, ApplicationError> {
        Ok(release_stale_claims(self.jobs.as_ref(), &self.state_machine, now, limit).await?)
    }
}

/// Which update job re-targets a corrected parent.
enum ParentTarget {
    Sku { sku: String, site_id: i64 },
    Group { group_by: GroupBy, group_key: GroupPath, site_id: i64 },
}

impl ParentTarget {
    fn into_payload(
        self,
        scope: DemandScope,
        forecast: Decimal,
        ignore_id: String,
        updated_by: String,
    ) -> JobPayload {
        let ignore = Some(ignore_id);
        match self {
            Self::Sku { sku, site_id } if site_id == ALL_SITES => {
                JobPayload::UpdateAllSiteSkuDemand(UpdateAllSiteSkuDemandPayload {
                    seller_id: scope.seller_id,
                    sku,
                    month_of_year: scope.month,
                    forecast,
                    demand_id_ignore_reset_daily_forecast: ignore,
                    updated_by,
                })
            }
            Self::Sku { sku, site_id } => JobPayload::UpdateSkuDemand(UpdateSkuDemandPayload {
                seller_id: scope.seller_id,
                sku,
                site_id,
                month_of_year: scope.month,
                metrics: MetricsPatch::forecast(forecast),
                need_update_all_site: true,
                demand_id_ignore_reset_daily_forecast: ignore,
                updated_by,
            }),
            Self::Group { group_by, group_key, site_id } if site_id == ALL_SITES => {
                JobPayload::UpdateAllSiteGroupDemand(UpdateAllSiteGroupDemandPayload {
                    seller_id: scope.seller_id,
                    group_by,
                    group_key,
                    month_of_year: scope.month,
                    forecast,
                    demand_id_ignore_reset_daily_forecast: ignore,
                    updated_by,
                })
            }
            Self::Group { group_by, group_key, site_id } => {
                JobPayload::UpdateGroupDemand(UpdateGroupDemandPayload {
                    seller_id: scope.seller_id,
                    group_by,
                    group_key,
                    site_id,
                    month_of_year: scope.month,
                    forecast,
                    need_update_all_site: true,
                    demand_id_ignore_reset_daily_forecast: ignore,
                    updated_by,
                })
            }
        }
    }
}

fn parent_target(
    snapshot: &DemandSnapshot,
    parent: &AggregateRef,
) -> Result<(Decimal, ParentTarget), DemandError> {
    let missing = || DemandError::AggregateNotFound(parent.to_string());
    match parent {
        AggregateRef::Sku(id) => {
            let row = snapshot.sku_rows().find(|row| &row.id == id).ok_or_else(missing)?;
            Ok((
                row.metrics.forecast,
                ParentTarget::Sku { sku: row.sku.clone(), site_id: row.site_id },
            ))
        }
        AggregateRef::Group(id) => {
            let row = snapshot.group_rows().find(|row| &row.id == id).ok_or_else(missing)?;
            Ok((
                row.metrics.forecast,
                ParentTarget::Group {
                    group_by: row.group_by,
                    group_key: row.group_key.clone(),
                    site_id: row.site_id,
                },
            ))
        }
    }
}
