use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::classification::{GroupBy, GroupPath};
use crate::domain::demand::{DemandScope, MetricsPatch, ALL_SITES, MAX_METRIC_MAGNITUDE};
use crate::domain::month::MonthOfYear;
use crate::errors::DemandError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleJobId(pub String);

impl fmt::Display for ScheduleJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTransitionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Unprocessed,
    Processing,
    Processed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unprocessed" => Some(Self::Unprocessed),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    UpdateSkuDemand,
    UpdateAllSiteSkuDemand,
    UpdateGroupDemand,
    UpdateAllSiteGroupDemand,
    SyncSkuDemand,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateSkuDemand => "update-sku-demand",
            Self::UpdateAllSiteSkuDemand => "update-all-site-sku-demand",
            Self::UpdateGroupDemand => "update-group-demand",
            Self::UpdateAllSiteGroupDemand => "update-all-site-group-demand",
            Self::SyncSkuDemand => "sync-sku-demand",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "update-sku-demand" => Some(Self::UpdateSkuDemand),
            "update-all-site-sku-demand" => Some(Self::UpdateAllSiteSkuDemand),
            "update-group-demand" => Some(Self::UpdateGroupDemand),
            "update-all-site-group-demand" => Some(Self::UpdateAllSiteGroupDemand),
            "sync-sku-demand" => Some(Self::SyncSkuDemand),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_actor() -> String {
    "scheduler".to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSkuDemandPayload {
    pub seller_id: i64,
    pub sku: String,
    pub site_id: i64,
    pub month_of_year: MonthOfYear,
    #[serde(default)]
    pub metrics: MetricsPatch,
    #[serde(default)]
    pub need_update_all_site: bool,
    #[serde(default)]
    pub demand_id_ignore_reset_daily_forecast: Option<String>,
    #[serde(default = "default_actor")]
    pub updated_by: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAllSiteSkuDemandPayload {
    pub seller_id: i64,
    pub sku: String,
    pub month_of_year: MonthOfYear,
    pub forecast: Decimal,
    #[serde(default)]
    pub demand_id_ignore_reset_daily_forecast: Option<String>,
    #[serde(default = "default_actor")]
    pub updated_by: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateGroupDemandPayload {
    pub seller_id: i64,
    pub group_by: GroupBy,
    pub group_key: GroupPath,
    pub site_id: i64,
    pub month_of_year: MonthOfYear,
    pub forecast: Decimal,
    #[serde(default)]
    pub need_update_all_site: bool,
    #[serde(default)]
    pub demand_id_ignore_reset_daily_forecast: Option<String>,
    #[serde(default = "default_actor")]
    pub updated_by: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAllSiteGroupDemandPayload {
    pub seller_id: i64,
    pub group_by: GroupBy,
    pub group_key: GroupPath,
    pub month_of_year: MonthOfYear,
    pub forecast: Decimal,
    #[serde(default)]
    pub demand_id_ignore_reset_daily_forecast: Option<String>,
    #[serde(default = "default_actor")]
    pub updated_by: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    pub sku: String,
    pub site_id: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSkuDemandPayload {
    pub seller_id: i64,
    pub month_of_year: MonthOfYear,
    pub items: Vec<SyncItem>,
    #[serde(default = "default_actor")]
    pub source: String,
}

/// Typed payload of a schedule job, one variant per [`JobType`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum JobPayload {
    UpdateSkuDemand(UpdateSkuDemandPayload),
    UpdateAllSiteSkuDemand(UpdateAllSiteSkuDemandPayload),
    UpdateGroupDemand(UpdateGroupDemandPayload),
    UpdateAllSiteGroupDemand(UpdateAllSiteGroupDemandPayload),
    SyncSkuDemand(SyncSkuDemandPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::UpdateSkuDemand(_) => JobType::UpdateSkuDemand,
            Self::UpdateAllSiteSkuDemand(_) => JobType::UpdateAllSiteSkuDemand,
            Self::UpdateGroupDemand(_) => JobType::UpdateGroupDemand,
            Self::UpdateAllSiteGroupDemand(_) => JobType::UpdateAllSiteGroupDemand,
            Self::SyncSkuDemand(_) => JobType::SyncSkuDemand,
        }
    }

    pub fn scope(&self) -> DemandScope {
        let (seller_id, month) = match self {
            Self::UpdateSkuDemand(p) => (p.seller_id, p.month_of_year),
            Self::UpdateAllSiteSkuDemand(p) => (p.seller_id, p.month_of_year),
            Self::UpdateGroupDemand(p) => (p.seller_id, p.month_of_year),
            Self::UpdateAllSiteGroupDemand(p) => (p.seller_id, p.month_of_year),
            Self::SyncSkuDemand(p) => (p.seller_id, p.month_of_year),
        };
        DemandScope { seller_id, month }
    }

    /// Id of the aggregate whose daily rows must be left as they are.
    pub fn ignore_daily_reset(&self) -> Option<&str> {
        match self {
            Self::UpdateSkuDemand(p) => p.demand_id_ignore_reset_daily_forecast.as_deref(),
            Self::UpdateAllSiteSkuDemand(p) => p.demand_id_ignore_reset_daily_forecast.as_deref(),
            Self::UpdateGroupDemand(p) => p.demand_id_ignore_reset_daily_forecast.as_deref(),
            Self::UpdateAllSiteGroupDemand(p) => p.demand_id_ignore_reset_daily_forecast.as_deref(),
            Self::SyncSkuDemand(_) => None,
        }
    }

    pub fn updated_by(&self) -> &str {
        match self {
            Self::UpdateSkuDemand(p) => &p.updated_by,
            Self::UpdateAllSiteSkuDemand(p) => &p.updated_by,
            Self::UpdateGroupDemand(p) => &p.updated_by,
            Self::UpdateAllSiteGroupDemand(p) => &p.updated_by,
            Self::SyncSkuDemand(p) => &p.source,
        }
    }

    /// Payload body without the type tag, as stored in `schedule_job.payload_json`.
    pub fn encode(&self) -> Result<String, DemandError> {
        let body = match self {
            Self::UpdateSkuDemand(p) => serde_json::to_string(p),
            Self::UpdateAllSiteSkuDemand(p) => serde_json::to_string(p),
            Self::UpdateGroupDemand(p) => serde_json::to_string(p),
            Self::UpdateAllSiteGroupDemand(p) => serde_json::to_string(p),
            Self::SyncSkuDemand(p) => serde_json::to_string(p),
        };
        body.map_err(|error| DemandError::InvalidPayload(error.to_string()))
    }

    pub fn decode(job_type: JobType, payload_json: &str) -> Result<Self, DemandError> {
        let invalid = |error: serde_json::Error| {
            DemandError::InvalidPayload(format!("{job_type}: {error}"))
        };
        let payload = match job_type {
            JobType::UpdateSkuDemand => {
                Self::UpdateSkuDemand(serde_json::from_str(payload_json).map_err(invalid)?)
            }
            JobType::UpdateAllSiteSkuDemand => {
                Self::UpdateAllSiteSkuDemand(serde_json::from_str(payload_json).map_err(invalid)?)
            }
            JobType::UpdateGroupDemand => {
                Self::UpdateGroupDemand(serde_json::from_str(payload_json).map_err(invalid)?)
            }
            JobType::UpdateAllSiteGroupDemand => Self::UpdateAllSiteGroupDemand(
                serde_json::from_str(payload_json).map_err(invalid)?,
            ),
            JobType::SyncSkuDemand => {
                Self::SyncSkuDemand(serde_json::from_str(payload_json).map_err(invalid)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Structural checks that do not need storage.
    pub fn validate(&self) -> Result<(), DemandError> {
        let invalid = |message: &str| Err(DemandError::InvalidPayload(message.to_owned()));
        match self {
            Self::UpdateSkuDemand(p) => {
                if p.sku.trim().is_empty() {
                    return invalid("sku must not be empty");
                }
                if p.site_id == ALL_SITES {
                    return invalid("update-sku-demand targets a physical site; use update-all-site-sku-demand for site 0");
                }
                if p.metrics.is_empty() {
                    return invalid("metrics must set at least one field");
                }
                if let Some(field) = p.metrics.out_of_range_field() {
                    return Err(out_of_range(field));
                }
            }
            Self::UpdateAllSiteSkuDemand(p) => {
                if p.sku.trim().is_empty() {
                    return invalid("sku must not be empty");
                }
                check_forecast(p.forecast)?;
            }
            Self::UpdateGroupDemand(p) => {
                if p.site_id == ALL_SITES {
                    return invalid("update-group-demand targets a physical site; use update-all-site-group-demand for site 0");
                }
                check_forecast(p.forecast)?;
            }
            Self::UpdateAllSiteGroupDemand(p) => check_forecast(p.forecast)?,
            Self::SyncSkuDemand(p) => {
                if p.items.is_empty() {
                    return invalid("sync-sku-demand needs at least one item");
                }
            }
        }
        Ok(())
    }
}

fn check_forecast(forecast: Decimal) -> Result<(), DemandError> {
    if forecast.abs() > MAX_METRIC_MAGNITUDE {
        return Err(out_of_range("forecast"));
    }
    Ok(())
}

fn out_of_range(field: &str) -> DemandError {
    DemandError::InvalidPayload(format!(
        "{field} exceeds the supported magnitude of {MAX_METRIC_MAGNITUDE}"
    ))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleJob {
    pub id: ScheduleJobId,
    pub job_type: JobType,
    pub payload_json: String,
    pub seller_id: i64,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_class: Option<String>,
    pub state_version: u32,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleJob {
    pub fn payload(&self) -> Result<JobPayload, DemandError> {
        JobPayload::decode(self.job_type, &self.payload_json)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransitionEvent {
    pub id: JobTransitionId,
    pub job_id: ScheduleJobId,
    pub from_status: Option<JobStatus>,
    pub to_status: JobStatus,
    pub transition_reason: String,
    pub error_class: Option<String>,
    pub decision_context_json: String,
    pub actor_type: String,
    pub actor_id: String,
    pub correlation_id: String,
    pub state_version: u32,
    pub occurred_at: DateTime<Utc>,
}
