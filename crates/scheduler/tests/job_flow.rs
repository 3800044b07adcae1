use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};

use demandplan_core::config::DistributionConfig;
use demandplan_core::domain::classification::{GroupBy, GroupPath};
use demandplan_core::domain::daily::{DailyPlan, DayForecast};
use demandplan_core::domain::demand::{AuditStamp, DemandLevel, DemandScope, MetricsPatch, SkuDemand};
use demandplan_core::domain::month::MonthOfYear;
use demandplan_core::domain::schedule_job::{
    JobPayload, JobStatus, JobType, SyncItem, SyncSkuDemandPayload, UpdateAllSiteGroupDemandPayload,
    UpdateGroupDemandPayload, UpdateSkuDemandPayload,
};
use demandplan_core::errors::{ApplicationError, DemandError};
use demandplan_core::events::{DemandEventPublisher, DemandForecastEvent};
use demandplan_core::job_engine::JobStateMachine;
use demandplan_db::repositories::{
    InMemoryClassificationIndex, InMemoryDemandStore, InMemoryScheduleJobRepository,
};
use demandplan_db::{DemandChangeSet, DemandStore, ScheduleJobRepository};
use demandplan_scheduler::{
    DailyCorrection, DemandPlanningService, GroupDemandQuery, JobHandler, JobOutcome, JobWorker,
    WorkerPool,
};

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<DemandForecastEvent>>,
    fail: bool,
}

#[async_trait]
impl DemandEventPublisher for RecordingPublisher {
    async fn publish(&self, event: &DemandForecastEvent) -> Result<(), DemandError> {
        if self.fail {
            return Err(DemandError::Publish("collaborator unavailable".to_owned()));
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Publisher whose every call takes `step` of simulated time.
struct SlowPublisher {
    clock: Arc<std::sync::Mutex<DateTime<Utc>>>,
    step: chrono::Duration,
}

#[async_trait]
impl DemandEventPublisher for SlowPublisher {
    async fn publish(&self, _event: &DemandForecastEvent) -> Result<(), DemandError> {
        let mut now = self.clock.lock().expect("clock");
        *now += self.step;
        Ok(())
    }
}

struct Harness {
    jobs: Arc<InMemoryScheduleJobRepository>,
    store: Arc<InMemoryDemandStore>,
    classification: Arc<InMemoryClassificationIndex>,
    publisher: Arc<RecordingPublisher>,
}

impl Harness {
    fn new() -> Self {
        Self::with_publisher(RecordingPublisher::default())
    }

    fn with_publisher(publisher: RecordingPublisher) -> Self {
        let jobs = Arc::new(InMemoryScheduleJobRepository::default());
        let store = Arc::new(InMemoryDemandStore::new(jobs.clone()));
        Self {
            jobs,
            store,
            classification: Arc::new(InMemoryClassificationIndex::default()),
            publisher: Arc::new(publisher),
        }
    }

    fn handler(&self, sync_after_update: bool) -> Arc<JobHandler> {
        Arc::new(
            JobHandler::new(self.store.clone(), self.classification.clone(), self.publisher.clone())
                .with_sync_after_update(sync_after_update),
        )
    }

    fn worker(&self, sync_after_update: bool) -> JobWorker {
        JobWorker::new(
            "worker-1",
            self.jobs.clone(),
            self.handler(sync_after_update),
            JobStateMachine::new(),
            DistributionConfig { forecast_scale: 2, utc_offset_minutes: 0 },
        )
    }

    fn service(&self) -> DemandPlanningService {
        DemandPlanningService::new(self.store.clone(), self.jobs.clone(), self.classification.clone())
    }

    async fn classify(&self, scope: DemandScope, sku: &str, category: &str) {
        self.classification.record_sku_path(scope, GroupBy::Category, sku, path(category)).await;
    }
}

fn future_scope() -> DemandScope {
    DemandScope { seller_id: 7, month: MonthOfYear::new(2099, 1).expect("month") }
}

fn path(value: &str) -> GroupPath {
    GroupPath::parse(value).expect("path")
}

fn dec(value: &str) -> Decimal {
    value.parse().expect("decimal")
}

fn sku_update(scope: DemandScope, sku: &str, site_id: i64, forecast: Decimal) -> JobPayload {
    JobPayload::UpdateSkuDemand(UpdateSkuDemandPayload {
        seller_id: scope.seller_id,
        sku: sku.to_owned(),
        site_id,
        month_of_year: scope.month,
        metrics: MetricsPatch::forecast(forecast),
        need_update_all_site: true,
        demand_id_ignore_reset_daily_forecast: None,
        updated_by: "planner".to_owned(),
    })
}

#[tokio::test]
async fn leaf_update_rolls_up_sites_and_category_path() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;

    let job = harness
        .service()
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(1_000_000)), None, "corr-1")
        .await
        .expect("submit");
    let report = harness.worker(false).run_once(Utc::now()).await.expect("tick");
    assert_eq!(report.processed, 1);

    let stored = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
    assert_eq!(stored.status, JobStatus::Processed);

    let skus = harness.store.list_sku_demands(scope).await.expect("skus");
    let forecast_at = |site_id: i64| {
        skus.iter().find(|row| row.sku == "sku1" && row.site_id == site_id).map(|row| row.metrics.forecast)
    };
    assert_eq!(forecast_at(1), Some(Decimal::from(1_000_000)));
    assert_eq!(forecast_at(0), Some(Decimal::from(1_000_000)));

    let groups = harness.store.list_group_demands(scope).await.expect("groups");
    for key in ["1", "1/2"] {
        for site_id in [0, 1] {
            let row = groups
                .iter()
                .find(|row| row.group_key == path(key) && row.site_id == site_id)
                .expect("group row");
            assert_eq!(row.metrics.forecast, Decimal::from(1_000_000));
            assert_eq!(row.number_of_skus, 1);
            assert!(row.is_latest_group);
        }
    }

    let site_one = skus.iter().find(|row| row.site_id == 1).expect("site row");
    let daily = harness.store.list_daily_forecasts(&site_one.aggregate_ref()).await.expect("daily");
    assert_eq!(daily.len(), 31);
    assert_eq!(daily[0].forecast, dec("32258.06"));
    assert_eq!(daily[30].forecast, dec("32258.20"));
    assert_eq!(daily.iter().map(|row| row.forecast).sum::<Decimal>(), Decimal::from(1_000_000));
}

#[tokio::test]
async fn second_leaf_is_summed_into_shared_ancestors() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;
    harness.classify(scope, "sku2", "1/3").await;

    let service = harness.service();
    service.submit_job(sku_update(scope, "sku1", 1, Decimal::from(100)), None, "c1").await.expect("submit");
    service.submit_job(sku_update(scope, "sku2", 1, Decimal::from(50)), None, "c2").await.expect("submit");
    let report = harness.worker(false).run_once(Utc::now()).await.expect("tick");
    assert_eq!(report.processed, 2);

    let groups = harness.store.list_group_demands(scope).await.expect("groups");
    let root = groups
        .iter()
        .find(|row| row.group_key == path("1") && row.site_id == 1)
        .expect("root group");
    assert_eq!(root.metrics.forecast, Decimal::from(150));
    assert_eq!(root.number_of_skus, 2);

    let branch = groups
        .iter()
        .find(|row| row.group_key == path("1/3") && row.site_id == 0)
        .expect("branch group");
    assert_eq!(branch.metrics.forecast, Decimal::from(50));
}

#[tokio::test]
async fn rollup_schedules_a_sync_job_that_publishes_current_forecasts() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;

    harness
        .service()
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(40)), None, "corr-sync")
        .await
        .expect("submit");
    let worker = harness.worker(true);
    worker.run_once(Utc::now()).await.expect("rollup tick");

    let pending = harness.jobs.list_by_status(JobStatus::Unprocessed, 10).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_type, JobType::SyncSkuDemand);
    assert_eq!(pending[0].correlation_id, "corr-sync");

    let report = worker.run_once(Utc::now()).await.expect("sync tick");
    assert_eq!(report.processed, 1);

    let events = harness.publisher.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].seller_id, 7);
    assert_eq!(events[0].month_of_year, "2099-01");
    assert!(events[0]
        .items
        .iter()
        .any(|item| item.sku == "sku1" && item.site_id == 1 && item.demand_forecast == Decimal::from(40)));
}

/// Submits each payload and drains the queue once per job.
async fn run_jobs(harness: &Harness, payloads: Vec<JobPayload>) {
    let worker = harness.worker(false);
    for payload in payloads {
        let job = harness.service().submit_job(payload, None, "corr-seed").await.expect("submit");
        worker.run_once(Utc::now()).await.expect("tick");
        let stored = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
        assert_eq!(stored.status, JobStatus::Processed, "{:?}", stored.last_error);
    }
}

async fn group_forecast(harness: &Harness, scope: DemandScope, key: &str, site_id: i64) -> Option<Decimal> {
    harness
        .store
        .list_group_demands(scope)
        .await
        .expect("groups")
        .into_iter()
        .find(|row| row.group_key == path(key) && row.site_id == site_id)
        .map(|row| row.metrics.forecast)
}

async fn sku_forecast(harness: &Harness, scope: DemandScope, sku: &str, site_id: i64) -> Option<Decimal> {
    harness
        .store
        .list_sku_demands(scope)
        .await
        .expect("skus")
        .into_iter()
        .find(|row| row.sku == sku && row.site_id == site_id)
        .map(|row| row.metrics.forecast)
}

#[tokio::test]
async fn group_job_splits_over_leaves_and_redistributes_days() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;
    harness.classify(scope, "sku2", "1/2").await;
    run_jobs(
        &harness,
        vec![
            sku_update(scope, "sku1", 1, Decimal::from(30)),
            sku_update(scope, "sku2", 1, Decimal::from(10)),
        ],
    )
    .await;

    run_jobs(
        &harness,
        vec![JobPayload::UpdateGroupDemand(UpdateGroupDemandPayload {
            seller_id: scope.seller_id,
            group_by: GroupBy::Category,
            group_key: path("1/2"),
            site_id: 1,
            month_of_year: scope.month,
            forecast: Decimal::from(80),
            need_update_all_site: true,
            demand_id_ignore_reset_daily_forecast: None,
            updated_by: "planner".to_owned(),
        })],
    )
    .await;

    assert_eq!(sku_forecast(&harness, scope, "sku1", 1).await, Some(Decimal::from(60)));
    assert_eq!(sku_forecast(&harness, scope, "sku2", 1).await, Some(Decimal::from(20)));
    assert_eq!(group_forecast(&harness, scope, "1/2", 1).await, Some(Decimal::from(80)));
    assert_eq!(group_forecast(&harness, scope, "1", 1).await, Some(Decimal::from(80)));
    assert_eq!(group_forecast(&harness, scope, "1/2", 0).await, Some(Decimal::from(80)));

    let groups = harness.store.list_group_demands(scope).await.expect("groups");
    let node = groups.iter().find(|row| row.group_key == path("1/2") && row.site_id == 1).expect("node");
    let days = harness.store.list_daily_forecasts(&node.aggregate_ref()).await.expect("days");
    assert_eq!(days.len(), 31);
    assert_eq!(days.iter().map(|row| row.forecast).sum::<Decimal>(), Decimal::from(80));
}

#[tokio::test]
async fn all_site_group_job_splits_over_sites_then_leaves() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;
    run_jobs(
        &harness,
        vec![
            sku_update(scope, "sku1", 1, Decimal::from(30)),
            sku_update(scope, "sku1", 2, Decimal::from(10)),
        ],
    )
    .await;

    run_jobs(
        &harness,
        vec![JobPayload::UpdateAllSiteGroupDemand(UpdateAllSiteGroupDemandPayload {
            seller_id: scope.seller_id,
            group_by: GroupBy::Category,
            group_key: path("1/2"),
            month_of_year: scope.month,
            forecast: Decimal::from(200),
            demand_id_ignore_reset_daily_forecast: None,
            updated_by: "planner".to_owned(),
        })],
    )
    .await;

    assert_eq!(sku_forecast(&harness, scope, "sku1", 1).await, Some(Decimal::from(150)));
    assert_eq!(sku_forecast(&harness, scope, "sku1", 2).await, Some(Decimal::from(50)));
    assert_eq!(sku_forecast(&harness, scope, "sku1", 0).await, Some(Decimal::from(200)));
    assert_eq!(group_forecast(&harness, scope, "1/2", 1).await, Some(Decimal::from(150)));
    assert_eq!(group_forecast(&harness, scope, "1/2", 2).await, Some(Decimal::from(50)));
    assert_eq!(group_forecast(&harness, scope, "1/2", 0).await, Some(Decimal::from(200)));
    assert_eq!(group_forecast(&harness, scope, "1", 0).await, Some(Decimal::from(200)));
}

#[tokio::test]
async fn replaying_a_committed_job_changes_nothing() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;

    let job = harness
        .service()
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(310)), None, "corr-replay")
        .await
        .expect("submit");
    harness.worker(true).run_once(Utc::now()).await.expect("tick");

    let pending_before = harness.jobs.list_by_status(JobStatus::Unprocessed, 10).await.expect("pending");
    assert_eq!(pending_before.len(), 1);
    assert_eq!(pending_before[0].job_type, JobType::SyncSkuDemand);

    let skus_before = harness.store.list_sku_demands(scope).await.expect("skus");
    let groups_before = harness.store.list_group_demands(scope).await.expect("groups");
    let mut days_before = Vec::new();
    for row in &skus_before {
        days_before.push(harness.store.list_daily_forecasts(&row.aggregate_ref()).await.expect("days"));
    }
    for row in &groups_before {
        days_before.push(harness.store.list_daily_forecasts(&row.aggregate_ref()).await.expect("days"));
    }

    let committed = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
    let today = DistributionConfig { forecast_scale: 2, utc_offset_minutes: 0 }.today(Utc::now());
    let outcome = harness.handler(true).handle(&committed, today).await.expect("replay");
    assert!(matches!(outcome, JobOutcome::Recalculated { daily_plans: 0, follow_up_jobs: 0, .. }));

    assert_eq!(harness.store.list_sku_demands(scope).await.expect("skus"), skus_before);
    assert_eq!(harness.store.list_group_demands(scope).await.expect("groups"), groups_before);
    let mut days_after = Vec::new();
    for row in &skus_before {
        days_after.push(harness.store.list_daily_forecasts(&row.aggregate_ref()).await.expect("days"));
    }
    for row in &groups_before {
        days_after.push(harness.store.list_daily_forecasts(&row.aggregate_ref()).await.expect("days"));
    }
    assert_eq!(days_after, days_before);

    let pending_after = harness.jobs.list_by_status(JobStatus::Unprocessed, 10).await.expect("pending");
    assert_eq!(pending_after.len(), 1);
    assert_eq!(pending_after[0].id, pending_before[0].id);
}

#[tokio::test]
async fn oversized_forecasts_are_refused_before_queueing() {
    let harness = Harness::new();
    let scope = future_scope();
    let service = harness.service();

    let error = service
        .submit_job(sku_update(scope, "sku1", 1, dec("100000000000000000000")), None, "corr-huge")
        .await
        .expect_err("oversized forecast");
    assert!(matches!(error, ApplicationError::Demand(DemandError::InvalidPayload(_))));
    assert!(harness.jobs.list_by_status(JobStatus::Unprocessed, 10).await.expect("pending").is_empty());

    let seeded = seed_sku_with_days(&harness, scope, 1, 10).await;
    let days = harness.store.list_daily_forecasts(&seeded.aggregate_ref()).await.expect("days");
    let error = service
        .update_daily_forecast(
            DailyCorrection {
                level: DemandLevel::Sku,
                daily_forecast_id: days[19].id.clone(),
                forecast: dec("100000000000000000000"),
                updated_by: "planner".to_owned(),
            },
            NaiveDate::from_ymd_opt(2099, 1, 1).expect("date"),
            "corr-huge-day",
        )
        .await
        .expect_err("oversized day");
    assert!(matches!(error, ApplicationError::Demand(DemandError::InvalidPayload(_))));
    let unchanged = harness.store.list_daily_forecasts(&seeded.aggregate_ref()).await.expect("days");
    assert_eq!(unchanged, days);
}

#[tokio::test]
async fn missing_classification_retries_then_fails_with_max_retries() {
    let harness = Harness::new();
    let scope = future_scope();

    let job = harness
        .service()
        .submit_job(sku_update(scope, "unknown", 1, Decimal::from(10)), Some(1), "corr-retry")
        .await
        .expect("submit");
    let worker = harness.worker(false);

    let now = Utc::now();
    let first = worker.run_once(now).await.expect("first tick");
    assert_eq!(first.retried, 1);
    let retried = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
    assert_eq!(retried.status, JobStatus::Unprocessed);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.available_at > now);
    assert_eq!(retried.last_error_class.as_deref(), Some("ClassificationNotFound"));

    let early = worker.run_once(now).await.expect("early tick");
    assert_eq!(early.claimed, 0);

    let later = now + chrono::Duration::seconds(60);
    let second = worker.run_once(later).await.expect("second tick");
    assert_eq!(second.failed, 1);
    let failed = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error_class.as_deref(), Some("MaxRetriesExceeded"));
    assert!(harness.store.list_sku_demands(scope).await.expect("skus").is_empty());
}

#[tokio::test]
async fn past_month_fails_terminally_and_rolls_back() {
    let harness = Harness::new();
    let scope = DemandScope { seller_id: 7, month: MonthOfYear::new(2020, 1).expect("month") };
    harness.classify(scope, "sku1", "1/2").await;

    let job = harness
        .service()
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(10)), Some(5), "corr-past")
        .await
        .expect("submit");
    let report = harness.worker(false).run_once(Utc::now()).await.expect("tick");
    assert_eq!(report.failed, 1);

    let failed = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(failed.last_error_class.as_deref(), Some("UpdateInPast"));
    assert!(harness.store.list_sku_demands(scope).await.expect("skus").is_empty());
    assert!(harness.store.list_group_demands(scope).await.expect("groups").is_empty());
}

#[tokio::test]
async fn publish_failures_are_retried() {
    let harness = Harness::with_publisher(RecordingPublisher { fail: true, ..Default::default() });
    let scope = future_scope();
    let stamp = AuditStamp::now("seed");
    let mut row = SkuDemand::new(scope, "sku1", 1, &stamp);
    row.metrics.forecast = Decimal::from(5);
    let uow = harness.store.begin(scope).await.expect("begin");
    let mut seed = DemandChangeSet::new(stamp);
    seed.skus.push(row);
    uow.commit(seed).await.expect("seed");

    let sync = JobPayload::SyncSkuDemand(SyncSkuDemandPayload {
        seller_id: scope.seller_id,
        month_of_year: scope.month,
        items: vec![SyncItem { sku: "sku1".to_owned(), site_id: 1 }],
        source: "operator".to_owned(),
    });
    let job = harness.service().submit_job(sync, Some(3), "corr-pub").await.expect("submit");

    let report = harness.worker(false).run_once(Utc::now()).await.expect("tick");
    assert_eq!(report.retried, 1);
    let stored = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
    assert_eq!(stored.last_error_class.as_deref(), Some("Publish"));
}

async fn seed_sku_with_days(harness: &Harness, scope: DemandScope, site_id: i64, per_day: i64) -> SkuDemand {
    let stamp = AuditStamp::now("seed");
    let days = scope.month.days_in_month();
    let mut row = SkuDemand::new(scope, "sku1", site_id, &stamp);
    row.metrics.forecast = Decimal::from(per_day * i64::from(days));

    let uow = harness.store.begin(scope).await.expect("begin");
    let mut seed = DemandChangeSet::new(stamp);
    seed.daily_plans.push(DailyPlan {
        parent: row.aggregate_ref(),
        seller_id: scope.seller_id,
        month: scope.month,
        clear_from_day: Some(1),
        days: (1..=days).map(|day| DayForecast { day, forecast: Decimal::from(per_day) }).collect(),
    });
    seed.skus.push(row.clone());
    uow.commit(seed).await.expect("seed");
    row
}

#[tokio::test]
async fn daily_correction_shifts_parent_and_keeps_its_days() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;
    let parent = seed_sku_with_days(&harness, scope, 1, 10).await;
    let service = harness.service();

    let days = service.daily_forecasts(&parent.aggregate_ref()).await.expect("days");
    let day_five = days.iter().find(|row| row.day == 5).expect("day 5");
    let today = NaiveDate::from_ymd_opt(2098, 12, 31).expect("date");

    let receipt = service
        .update_daily_forecast(
            DailyCorrection {
                level: DemandLevel::Sku,
                daily_forecast_id: day_five.id.clone(),
                forecast: Decimal::from(20),
                updated_by: "planner".to_owned(),
            },
            today,
            "corr-day",
        )
        .await
        .expect("correction");
    assert_eq!(receipt.previous, Decimal::from(10));
    assert_eq!(receipt.parent_forecast, Decimal::from(320));

    let job = harness.jobs.find_by_id(&receipt.job_id).await.expect("find").expect("job");
    match job.payload().expect("payload") {
        JobPayload::UpdateSkuDemand(payload) => {
            assert_eq!(payload.metrics.forecast, Some(Decimal::from(320)));
            assert_eq!(payload.demand_id_ignore_reset_daily_forecast.as_deref(), Some(parent.id.0.as_str()));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    let report = harness.worker(false).run_once(Utc::now()).await.expect("tick");
    assert_eq!(report.processed, 1);

    let stored = harness.store.find_sku_demand(&parent.id).await.expect("find").expect("row");
    assert_eq!(stored.metrics.forecast, Decimal::from(320));

    let kept = service.daily_forecasts(&parent.aggregate_ref()).await.expect("days");
    assert_eq!(kept.iter().find(|row| row.day == 5).map(|row| row.forecast), Some(Decimal::from(20)));
    assert_eq!(kept.iter().find(|row| row.day == 6).map(|row| row.forecast), Some(Decimal::from(10)));

    let total = harness
        .store
        .list_sku_demands(scope)
        .await
        .expect("skus")
        .into_iter()
        .find(|row| row.site_id == 0)
        .expect("all-site row");
    assert_eq!(total.metrics.forecast, Decimal::from(320));
    let total_days = service.daily_forecasts(&total.aggregate_ref()).await.expect("days");
    assert_eq!(total_days.iter().map(|row| row.forecast).sum::<Decimal>(), Decimal::from(320));
}

#[tokio::test]
async fn daily_correction_rejects_frozen_days_without_writing() {
    let harness = Harness::new();
    let scope = future_scope();
    let parent = seed_sku_with_days(&harness, scope, 1, 10).await;
    let service = harness.service();

    let days = service.daily_forecasts(&parent.aggregate_ref()).await.expect("days");
    let day_ten = days.iter().find(|row| row.day == 10).expect("day 10");
    let today = NaiveDate::from_ymd_opt(2099, 1, 15).expect("date");

    let error = service
        .update_daily_forecast(
            DailyCorrection {
                level: DemandLevel::Sku,
                daily_forecast_id: day_ten.id.clone(),
                forecast: Decimal::from(99),
                updated_by: "planner".to_owned(),
            },
            today,
            "corr-frozen",
        )
        .await
        .expect_err("day 10 is frozen");
    assert!(matches!(error, ApplicationError::Demand(DemandError::UpdateInPast { day: 10, .. })));

    let after = service.daily_forecasts(&parent.aggregate_ref()).await.expect("days");
    assert_eq!(after, days);
    assert!(harness.jobs.list_by_status(JobStatus::Unprocessed, 10).await.expect("jobs").is_empty());
}

#[tokio::test]
async fn refresh_latest_groups_requires_known_paths() {
    let harness = Harness::new();
    let scope = future_scope();

    let error = harness
        .service()
        .refresh_latest_groups(scope, GroupBy::Category, "operator")
        .await
        .expect_err("no paths recorded");
    assert!(matches!(error, ApplicationError::Demand(DemandError::ClassificationNotFound { .. })));
}

#[tokio::test]
async fn refresh_latest_groups_clears_retired_nodes() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;
    harness
        .service()
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(10)), None, "corr")
        .await
        .expect("submit");
    harness.worker(false).run_once(Utc::now()).await.expect("tick");

    harness.classification.record_group_path(scope, GroupBy::Category, path("1/3")).await;
    let flipped = harness
        .service()
        .refresh_latest_groups(scope, GroupBy::Category, "operator")
        .await
        .expect("refresh");
    assert_eq!(flipped, 2);

    let groups = harness.store.list_group_demands(scope).await.expect("groups");
    assert!(groups.iter().filter(|row| row.group_key == path("1/2")).all(|row| !row.is_latest_group));
    assert!(groups.iter().filter(|row| row.group_key == path("1")).all(|row| row.is_latest_group));
}

#[tokio::test]
async fn current_view_hides_retired_nodes_until_history_is_requested() {
    let harness = Harness::new();
    let scope = future_scope();
    let service = harness.service();
    harness.classify(scope, "sku1", "1/2").await;
    service
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(10)), None, "corr")
        .await
        .expect("submit");
    harness.worker(false).run_once(Utc::now()).await.expect("tick");

    harness.classification.record_group_path(scope, GroupBy::Category, path("1/3")).await;
    service.refresh_latest_groups(scope, GroupBy::Category, "operator").await.expect("refresh");

    let current = service.list_group_demands(&GroupDemandQuery::current(scope)).await.expect("current");
    assert_eq!(current.total, 2);
    assert!(current.rows.iter().all(|row| row.group_key == path("1")));
    assert_eq!(current.rows.iter().map(|row| row.site_id).collect::<Vec<_>>(), vec![0, 1]);

    let history = service
        .list_group_demands(&GroupDemandQuery { latest_only: false, ..GroupDemandQuery::current(scope) })
        .await
        .expect("history");
    assert_eq!(history.total, 4);
    let retired = history.rows.iter().find(|row| !row.is_latest_group).expect("retired row");
    assert_eq!(retired.group_key, path("1/2"));

    let fetched = service.group_demand(&retired.id).await.expect("by id");
    assert_eq!(&fetched, retired);
    assert!(matches!(
        service.group_demand(&demandplan_core::domain::demand::GroupDemandId("missing".to_owned())).await,
        Err(ApplicationError::NotFound(_))
    ));
}

#[tokio::test]
async fn stale_claims_return_to_the_queue() {
    let harness = Harness::new();
    let scope = future_scope();
    let service = harness.service();
    let job = service
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(10)), None, "corr-stale")
        .await
        .expect("submit");

    let machine = JobStateMachine::new();
    let claimed_at = Utc::now();
    let claimed = machine.claim_job(job.clone(), "crashed-worker", claimed_at).expect("claim");
    assert!(harness.jobs.compare_and_set(&claimed, job.state_version).await.expect("cas"));

    assert_eq!(service.recover_stale(claimed_at, 10).await.expect("recover"), 0);
    let later = claimed_at + chrono::Duration::seconds(301);
    assert_eq!(service.recover_stale(later, 10).await.expect("recover"), 1);

    let released = service.job_status(&job.id).await.expect("status");
    assert_eq!(released.status, JobStatus::Unprocessed);
    assert_eq!(released.retry_count, 0);
    assert_eq!(released.claimed_by, None);

    let history = service.job_history(&job.id).await.expect("history");
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn slow_jobs_do_not_backdate_later_claims() {
    let harness = Harness::new();
    let scope = future_scope();
    let stamp = AuditStamp::now("seed");
    let mut row = SkuDemand::new(scope, "sku1", 1, &stamp);
    row.metrics.forecast = Decimal::from(5);
    let uow = harness.store.begin(scope).await.expect("begin");
    let mut seed = DemandChangeSet::new(stamp);
    seed.skus.push(row);
    uow.commit(seed).await.expect("seed");

    let service = harness.service();
    let mut submitted = Vec::new();
    for correlation_id in ["corr-slow-1", "corr-slow-2"] {
        let sync = JobPayload::SyncSkuDemand(SyncSkuDemandPayload {
            seller_id: scope.seller_id,
            month_of_year: scope.month,
            items: vec![SyncItem { sku: "sku1".to_owned(), site_id: 1 }],
            source: "operator".to_owned(),
        });
        submitted.push(service.submit_job(sync, None, correlation_id).await.expect("submit"));
    }

    let tick = Utc::now();
    let clock = Arc::new(std::sync::Mutex::new(tick));
    let step = chrono::Duration::seconds(400);
    let handler = Arc::new(JobHandler::new(
        harness.store.clone(),
        harness.classification.clone(),
        Arc::new(SlowPublisher { clock: clock.clone(), step }),
    ));
    let reader = clock.clone();
    let worker = JobWorker::new(
        "worker-slow",
        harness.jobs.clone(),
        handler,
        JobStateMachine::new(),
        DistributionConfig { forecast_scale: 2, utc_offset_minutes: 0 },
    )
    .with_batch_size(2)
    .with_clock(Arc::new(move || *reader.lock().expect("clock")));

    let report = worker.run_once(tick).await.expect("tick");
    assert_eq!(report.processed, 2);
    assert_eq!(report.conflicts, 0);

    let mut claims = Vec::new();
    let mut finishes = Vec::new();
    for job in &submitted {
        let history = service.job_history(&job.id).await.expect("history");
        let claimed = history
            .iter()
            .find(|event| event.to_status == JobStatus::Processing)
            .expect("claim transition");
        claims.push(claimed.occurred_at);
        let stored = service.job_status(&job.id).await.expect("status");
        finishes.push(stored.executed_at.expect("executed"));
    }
    claims.sort();
    finishes.sort();

    assert_eq!(claims, vec![tick, tick + step]);
    assert_eq!(finishes, vec![tick + step, tick + step * 2]);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let harness = Harness::new();
    let error = harness
        .service()
        .job_status(&demandplan_core::domain::schedule_job::ScheduleJobId("missing".to_owned()))
        .await
        .expect_err("missing");
    assert!(matches!(error, ApplicationError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pool_drains_queue_and_stops_on_shutdown() {
    let harness = Harness::new();
    let scope = future_scope();
    harness.classify(scope, "sku1", "1/2").await;
    let job = harness
        .service()
        .submit_job(sku_update(scope, "sku1", 1, Decimal::from(62)), None, "corr-pool")
        .await
        .expect("submit");

    let pool = WorkerPool::new(vec![harness.worker(false), harness.worker(false)], Duration::from_millis(10));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pool.spawn(shutdown_rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = harness.jobs.find_by_id(&job.id).await.expect("find").expect("job");
        if stored.status == JobStatus::Processed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job was not processed in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).expect("signal");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle).await.expect("stopped").expect("join");
    }
}
