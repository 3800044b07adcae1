//! Job execution for demand planning: the dispatcher that runs each job type,
//! the polling worker pool and the service used by the HTTP and CLI surfaces.

pub mod handler;
pub mod publisher;
pub mod service;
pub mod worker;

pub use handler::{JobHandler, JobOutcome, SYNC_SOURCE};
pub use publisher::{build_publisher, LoggingPublisher, WebhookPublisher};
pub use service::{
    DailyCorrection, DailyCorrectionReceipt, DemandPlanningService, GroupDemandPage,
    GroupDemandQuery, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};
pub use worker::{release_stale_claims, Clock, JobWorker, TickReport, WorkerPool};
