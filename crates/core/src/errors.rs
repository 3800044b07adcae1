use chrono::NaiveDate;
use thiserror::Error;

use crate::{domain::month::MonthOfYear, job_engine::RetryPolicy};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid month of year `{0}`, expected YYYY-MM")]
    InvalidMonth(String),
    #[error("invalid group path `{0}`")]
    InvalidGroupPath(String),
    #[error("day {day} does not exist in {month}")]
    InvalidDay { day: u32, month: MonthOfYear },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
    #[error("metric `{0}` is out of range")]
    MetricOverflow(String),
}

/// Failure taxonomy for rollup, distribution and job handling.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DemandError {
    #[error("classification not found for {subject} in {month}")]
    ClassificationNotFound { subject: String, month: MonthOfYear },
    #[error("cannot update day {day} of {month}: today is {today}")]
    UpdateInPast { month: MonthOfYear, day: u32, today: NaiveDate },
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("event publish failure: {0}")]
    Publish(String),
    #[error("retries exhausted after {retries} attempts: {last_error}")]
    MaxRetriesExceeded { retries: u32, last_error: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl DemandError {
    /// Whether a job failing with this error may run again.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::ClassificationNotFound { .. }
            | Self::AggregateNotFound(_)
            | Self::Storage(_)
            | Self::Publish(_) => RetryPolicy::Retry,
            Self::UpdateInPast { .. }
            | Self::InvalidPayload(_)
            | Self::MaxRetriesExceeded { .. }
            | Self::Domain(_) => RetryPolicy::FailTerminal,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::ClassificationNotFound { .. } => "ClassificationNotFound",
            Self::UpdateInPast { .. } => "UpdateInPast",
            Self::AggregateNotFound(_) => "AggregateNotFound",
            Self::InvalidPayload(_) => "InvalidPayload",
            Self::Storage(_) => "Storage",
            Self::Publish(_) => "Publish",
            Self::MaxRetriesExceeded { .. } => "MaxRetriesExceeded",
            Self::Domain(_) => "DomainViolation",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Demand(DemandError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<DemandError> for ApplicationError {
    fn from(value: DemandError) -> Self {
        match value {
            DemandError::Storage(message) => Self::Persistence(message),
            DemandError::Publish(message) => Self::Integration(message),
            DemandError::Domain(error) => Self::Domain(error),
            other => Self::Demand(other),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::Demand(error) => match error.retry_policy() {
                RetryPolicy::FailTerminal => {
                    Self::BadRequest { message: error.to_string(), correlation_id }
                }
                RetryPolicy::Retry => {
                    Self::ServiceUnavailable { message: error.to_string(), correlation_id }
                }
            },
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::domain::month::MonthOfYear;
    use crate::errors::{ApplicationError, DemandError, DomainError, InterfaceError};
    use crate::job_engine::RetryPolicy;

    fn november() -> MonthOfYear {
        MonthOfYear::new(2023, 11).expect("valid month")
    }

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface =
            ApplicationError::from(DomainError::InvalidMonth("2023-13".to_owned()))
                .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn storage_error_maps_to_service_unavailable() {
        let interface = ApplicationError::from(DemandError::Storage("database is locked".into()))
            .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.correlation_id(), "req-2");
    }

    #[test]
    fn update_in_past_is_terminal_and_a_bad_request() {
        let error = DemandError::UpdateInPast {
            month: november(),
            day: 9,
            today: NaiveDate::from_ymd_opt(2023, 11, 9).expect("date"),
        };
        assert_eq!(error.retry_policy(), RetryPolicy::FailTerminal);
        assert_eq!(error.error_class(), "UpdateInPast");

        let interface = ApplicationError::from(error).into_interface("req-3");
        assert!(matches!(interface, InterfaceError::BadRequest { .. }));
    }

    #[test]
    fn classification_gaps_and_transport_failures_are_retryable() {
        let missing = DemandError::ClassificationNotFound {
            subject: "sku sku1".to_owned(),
            month: november(),
        };
        assert_eq!(missing.retry_policy(), RetryPolicy::Retry);
        assert_eq!(DemandError::Publish("timeout".into()).retry_policy(), RetryPolicy::Retry);
        assert_eq!(
            DemandError::InvalidPayload("missing sku".into()).retry_policy(),
            RetryPolicy::FailTerminal
        );
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("invalid endpoint".to_owned()).into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
