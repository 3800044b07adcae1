//! Job submission, daily forecast and group view endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use demandplan_core::config::DistributionConfig;
use demandplan_core::domain::classification::{GroupBy, GroupPath};
use demandplan_core::domain::daily::{DailyForecast, DailyForecastId};
use demandplan_core::domain::demand::{
    AggregateRef, DemandLevel, DemandScope, GroupDemand, GroupDemandId, SkuDemandId,
};
use demandplan_core::domain::month::MonthOfYear;
use demandplan_core::domain::schedule_job::{
    JobPayload, JobStatus, JobTransitionEvent, JobType, ScheduleJob, ScheduleJobId,
};
use demandplan_core::errors::{ApplicationError, DomainError, InterfaceError};
use demandplan_scheduler::{
    DailyCorrection, DailyCorrectionReceipt, DemandPlanningService, GroupDemandPage,
    GroupDemandQuery, DEFAULT_PAGE_LIMIT,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    service: Arc<DemandPlanningService>,
    distribution: DistributionConfig,
}

impl ApiState {
    pub fn new(service: Arc<DemandPlanningService>, distribution: DistributionConfig) -> Self {
        Self { service, distribution }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    pub max_retries: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: ScheduleJobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub correlation_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobStatusResponse {
    pub job: ScheduleJob,
    pub transitions: Vec<JobTransitionEvent>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DailyForecastUpdate {
    pub forecast: Decimal,
    pub updated_by: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GroupDemandParams {
    pub seller_id: i64,
    pub month_of_year: String,
    pub group_by: Option<String>,
    pub group_key: Option<String>,
    pub site_id: Option<i64>,
    pub latest_only: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: &'static str,
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{job_id}", get(job_status))
        .route("/aggregates/{level}/{aggregate_id}/daily-forecasts", get(list_daily_forecasts))
        .route("/daily-forecasts/{level}/{daily_forecast_id}", put(update_daily_forecast))
        .route("/group-demands", get(list_group_demands))
        .route("/group-demands/{group_demand_id}", get(group_demand))
        .with_state(state)
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    Json(payload): Json<JobPayload>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let correlation_id = correlation_id(&headers);
    let job = state
        .service
        .submit_job(payload, query.max_retries, &correlation_id)
        .await
        .map_err(|error| api_error(error, &correlation_id))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id,
            job_type: job.job_type,
            status: job.status,
            correlation_id,
        }),
    ))
}

pub async fn job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<JobStatusResponse>> {
    let correlation_id = correlation_id(&headers);
    let id = ScheduleJobId(job_id);
    let job = state.service.job_status(&id).await.map_err(|error| api_error(error, &correlation_id))?;
    let transitions =
        state.service.job_history(&id).await.map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(JobStatusResponse { job, transitions }))
}

pub async fn list_daily_forecasts(
    State(state): State<ApiState>,
    Path((level, aggregate_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<DailyForecast>>> {
    let correlation_id = correlation_id(&headers);
    let parent = match parse_level(&level, &correlation_id)? {
        DemandLevel::Sku => AggregateRef::Sku(SkuDemandId(aggregate_id)),
        DemandLevel::Group => AggregateRef::Group(GroupDemandId(aggregate_id)),
    };
    let rows = state
        .service
        .daily_forecasts(&parent)
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(rows))
}

pub async fn update_daily_forecast(
    State(state): State<ApiState>,
    Path((level, daily_forecast_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(update): Json<DailyForecastUpdate>,
) -> ApiResult<Json<DailyCorrectionReceipt>> {
    let correlation_id = correlation_id(&headers);
    let level = parse_level(&level, &correlation_id)?;
    let today = state.distribution.today(Utc::now());

    let receipt = state
        .service
        .update_daily_forecast(
            DailyCorrection {
                level,
                daily_forecast_id: DailyForecastId(daily_forecast_id),
                forecast: update.forecast,
                updated_by: update.updated_by,
            },
            today,
            &correlation_id,
        )
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(receipt))
}

/// Current group hierarchy of a scope; `latest_only=false` includes retired nodes.
pub async fn list_group_demands(
    State(state): State<ApiState>,
    Query(params): Query<GroupDemandParams>,
    headers: HeaderMap,
) -> ApiResult<Json<GroupDemandPage>> {
    let correlation_id = correlation_id(&headers);
    let query = group_query(params).map_err(|error| api_error(error, &correlation_id))?;
    let page = state
        .service
        .list_group_demands(&query)
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(page))
}

pub async fn group_demand(
    State(state): State<ApiState>,
    Path(group_demand_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<GroupDemand>> {
    let correlation_id = correlation_id(&headers);
    let row = state
        .service
        .group_demand(&GroupDemandId(group_demand_id))
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(row))
}

fn group_query(params: GroupDemandParams) -> Result<GroupDemandQuery, ApplicationError> {
    let month = MonthOfYear::parse(&params.month_of_year)?;
    let group_by = params
        .group_by
        .as_deref()
        .map(|raw| {
            GroupBy::parse(raw).ok_or_else(|| {
                DomainError::InvariantViolation(format!(
                    "unknown group_by `{raw}` (expected category|segment)"
                ))
            })
        })
        .transpose()?;
    let group_key = params.group_key.as_deref().map(GroupPath::parse).transpose()?;

    Ok(GroupDemandQuery {
        scope: DemandScope { seller_id: params.seller_id, month },
        group_by,
        group_key,
        site_id: params.site_id,
        latest_only: params.latest_only.unwrap_or(true),
        limit: params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        offset: params.offset.unwrap_or(0),
    })
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn parse_level(raw: &str, correlation_id: &str) -> ApiResult<DemandLevel> {
    DemandLevel::parse(raw).ok_or_else(|| {
        api_error(
            ApplicationError::Domain(DomainError::InvariantViolation(format!(
                "unknown aggregate level `{raw}` (expected sku|group)"
            ))),
            correlation_id,
        )
    })
}

fn api_error(error: ApplicationError, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    let interface = error.into_interface(correlation_id);
    let status = match &interface {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(
            event_name = "api.request.failed",
            correlation_id = %correlation_id,
            http_status = status.as_u16(),
            error = %interface,
            "request failed"
        );
    }

    let error = match &interface {
        InterfaceError::Internal { .. } => interface.user_message().to_string(),
        other => other.to_string(),
    };
    (
        status,
        Json(ApiError {
            error,
            message: interface.user_message(),
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}
