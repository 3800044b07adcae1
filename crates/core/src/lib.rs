pub mod config;
pub mod distribution;
pub mod domain;
pub mod errors;
pub mod events;
pub mod job_engine;
pub mod rollup;

pub use distribution::{DayCorrection, DistributionEngine};
pub use domain::classification::{ClassificationMap, GroupBy, GroupPath, SkuClassification};
pub use domain::daily::{DailyForecast, DailyForecastId, DailyPlan, DayForecast};
pub use domain::demand::{
    AggregateRef, AuditStamp, DemandLevel, DemandMetrics, DemandScope, GroupDemand,
    GroupDemandId, MetricsPatch, SkuDemand, SkuDemandId, ALL_SITES,
};
pub use domain::month::MonthOfYear;
pub use domain::schedule_job::{
    JobPayload, JobStatus, JobTransitionEvent, JobType, ScheduleJob, ScheduleJobId,
};
pub use errors::{ApplicationError, DemandError, DomainError, InterfaceError};
pub use events::{DemandEventPublisher, DemandForecastEvent, DemandForecastItem};
pub use job_engine::{JobEngineConfig, JobStateMachine, JobTransitionError, RetryPolicy};
pub use rollup::{DemandSnapshot, GroupUpdate, LeafUpdate, RollupEngine};
