pub mod classification;
pub mod daily;
pub mod demand;
pub mod month;
pub mod schedule_job;
