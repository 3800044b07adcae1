//! Executes one claimed job: the rollup and redistribution jobs inside a
//! scope-locked unit of work, and sync jobs against the event publisher.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use demandplan_core::distribution::DistributionEngine;
use demandplan_core::domain::demand::{AuditStamp, DemandScope};
use demandplan_core::domain::schedule_job::{
    JobPayload, ScheduleJob, SyncItem, SyncSkuDemandPayload,
};
use demandplan_core::errors::DemandError;
use demandplan_core::events::{DemandEventPublisher, DemandForecastEvent, DemandForecastItem};
use demandplan_core::job_engine::JobStateMachine;
use demandplan_core::rollup::{DemandSnapshot, GroupUpdate, LeafUpdate, RollupEngine, RollupSummary};
use demandplan_core::ClassificationMap;
use demandplan_db::{ClassificationIndex, DemandChangeSet, DemandStore};

pub const SYNC_SOURCE: &str = "demand-rollup";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Recalculated {
        skus_written: usize,
        groups_recomputed: usize,
        daily_plans: usize,
        follow_up_jobs: usize,
    },
    Published {
        event_key: String,
        items: usize,
    },
    NothingToPublish,
}

pub struct JobHandler {
    store: Arc<dyn DemandStore>,
    classification: Arc<dyn ClassificationIndex>,
    publisher: Arc<dyn DemandEventPublisher>,
    state_machine: JobStateMachine,
    rollup: RollupEngine,
    distribution: DistributionEngine,
    sync_after_update: bool,
}

impl JobHandler {
    pub fn new(
        store: Arc<dyn DemandStore>,
        classification: Arc<dyn ClassificationIndex>,
        publisher: Arc<dyn DemandEventPublisher>,
    ) -> Self {
        Self {
            store,
            classification,
            publisher,
            state_machine: JobStateMachine::new(),
            rollup: RollupEngine::default(),
            distribution: DistributionEngine::default(),
            sync_after_update: true,
        }
    }

    pub fn with_state_machine(mut self, state_machine: JobStateMachine) -> Self {
        self.state_machine = state_machine;
        self
    }

    /// Decimal places kept when forecasts are split over SKUs, sites or days.
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.rollup = RollupEngine::new(scale);
        self.distribution = DistributionEngine::new(scale);
        self
    }

    pub fn with_sync_after_update(mut self, enabled: bool) -> Self {
        self.sync_after_update = enabled;
        self
    }

    pub async fn handle(&self, job: &ScheduleJob, today: NaiveDate) -> Result<JobOutcome, DemandError> {
        let payload = job.payload()?;
        match &payload {
            JobPayload::SyncSkuDemand(sync) => self.publish(sync).await,
            _ => self.recalculate(job, &payload, today).await,
        }
    }

    async fn recalculate(
        &self,
        job: &ScheduleJob,
        payload: &JobPayload,
        today: NaiveDate,
    ) -> Result<JobOutcome, DemandError> {
        let scope = payload.scope();
        // Resolved before the scope is locked; classification is read-only here.
        let classifications = self.classification.resolve_month(scope).await?;
        let stamp = AuditStamp::now(payload.updated_by());

        let mut uow = self.store.begin(scope).await?;
        let mut snapshot = uow.load_snapshot().await?;
        let summary = self.apply_rollup(payload, &mut snapshot, &classifications, &stamp)?;

        let mut changes = DemandChangeSet::from_snapshot(snapshot.changes(), stamp.clone());
        let ignore = payload.ignore_daily_reset();
        for change in snapshot.forecast_changes() {
            if ignore == Some(change.parent.id()) {
                continue;
            }
            let existing = uow.daily_forecasts(&change.parent).await?;
            let plan = self.distribution.redistribute(
                change.parent,
                scope.seller_id,
                scope.month,
                &existing,
                change.current,
                today,
            )?;
            changes.daily_plans.push(plan);
        }

        if self.sync_after_update {
            if let Some(sync) = sync_payload(scope, &changes) {
                let created = self.state_machine.create_job(
                    &JobPayload::SyncSkuDemand(sync),
                    None,
                    job.correlation_id.clone(),
                    Utc::now(),
                )?;
                changes.jobs.push(created);
            }
        }

        let outcome = JobOutcome::Recalculated {
            skus_written: summary.skus_written,
            groups_recomputed: summary.groups_recomputed,
            daily_plans: changes.daily_plans.len(),
            follow_up_jobs: changes.jobs.len(),
        };
        uow.commit(changes).await?;

        info!(
            event_name = "demand.job.recalculated",
            correlation_id = %job.correlation_id,
            job_id = %job.id,
            job_type = %job.job_type,
            seller_id = scope.seller_id,
            month_of_year = %scope.month,
            skus_written = summary.skus_written,
            groups_recomputed = summary.groups_recomputed,
            "demand recalculated"
        );
        Ok(outcome)
    }

    fn apply_rollup(
        &self,
        payload: &JobPayload,
        snapshot: &mut DemandSnapshot,
        classifications: &ClassificationMap,
        stamp: &AuditStamp,
    ) -> Result<RollupSummary, DemandError> {
        match payload {
            JobPayload::UpdateSkuDemand(p) => self.rollup.apply_leaf_update(
                snapshot,
                classifications,
                &LeafUpdate {
                    sku: p.sku.clone(),
                    site_id: p.site_id,
                    patch: p.metrics.clone(),
                    recompute_all_sites: p.need_update_all_site,
                },
                stamp,
            ),
            JobPayload::UpdateAllSiteSkuDemand(p) => self.rollup.apply_all_site_sku_update(
                snapshot,
                classifications,
                &p.sku,
                p.forecast,
                stamp,
            ),
            JobPayload::UpdateGroupDemand(p) => self.rollup.apply_group_update(
                snapshot,
                classifications,
                &GroupUpdate {
                    group_by: p.group_by,
                    group_key: p.group_key.clone(),
                    site_id: p.site_id,
                    forecast: p.forecast,
                    recompute_all_sites: p.need_update_all_site,
                },
                stamp,
            ),
            JobPayload::UpdateAllSiteGroupDemand(p) => self.rollup.apply_all_site_group_update(
                snapshot,
                classifications,
                p.group_by,
                &p.group_key,
                p.forecast,
                stamp,
            ),
            JobPayload::SyncSkuDemand(_) => Err(DemandError::InvalidPayload(
                "sync-sku-demand does not recalculate aggregates".to_string(),
            )),
        }
    }

    /// Publishes the forecasts as stored now, so a delayed retry never sends a
    /// value older than the last committed rollup.
    async fn publish(&self, sync: &SyncSkuDemandPayload) -> Result<JobOutcome, DemandError> {
        let scope = DemandScope { seller_id: sync.seller_id, month: sync.month_of_year };
        let rows = self.store.list_sku_demands(scope).await?;

        let mut items = Vec::with_capacity(sync.items.len());
        for item in &sync.items {
            match rows.iter().find(|row| row.sku == item.sku && row.site_id == item.site_id) {
                Some(row) => items.push(DemandForecastItem {
                    site_id: row.site_id,
                    sku: row.sku.clone(),
                    demand_forecast: row.metrics.forecast,
                }),
                None => warn!(
                    event_name = "demand.sync.item_missing",
                    seller_id = scope.seller_id,
                    month_of_year = %scope.month,
                    sku = %item.sku,
                    site_id = item.site_id,
                    "skipping sync item without a stored demand row"
                ),
            }
        }

        if items.is_empty() {
            return Ok(JobOutcome::NothingToPublish);
        }

        let event = DemandForecastEvent::new(
            scope.seller_id,
            scope.month.to_string(),
            sync.source.clone(),
            items,
        );
        self.publisher.publish(&event).await?;
        Ok(JobOutcome::Published { event_key: event.event_key, items: event.items.len() })
    }
}

fn sync_payload(scope: DemandScope, changes: &DemandChangeSet) -> Option<SyncSkuDemandPayload> {
    if changes.skus.is_empty() {
        return None;
    }
    let items = changes
        .skus
        .iter()
        .map(|row| SyncItem { sku: row.sku.clone(), site_id: row.site_id })
        .collect();
    Some(SyncSkuDemandPayload {
        seller_id: scope.seller_id,
        month_of_year: scope.month,
        items,
        source: SYNC_SOURCE.to_string(),
    })
}
