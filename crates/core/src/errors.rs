use thiserror::Error;

use crate::domain::job::JobStatus;
use crate::domain::operation::OperationType;

/// Failures raised while admitting or transitioning an AI operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no active model supports operation `{operation}`")]
    NoCapableModel { operation: OperationType },
    #[error("no active template for operation `{operation}`")]
    TemplateMissing { operation: OperationType },
    #[error("template `{template}` requires parameter `{param}`")]
    TemplateParam { template: String, param: String },
    #[error(
        "quota exceeded for user `{user_id}`: {requests_remaining} requests and \
         {tokens_remaining} tokens remaining, {estimated_tokens} tokens requested"
    )]
    QuotaExceeded {
        user_id: String,
        requests_remaining: u32,
        tokens_remaining: u32,
        estimated_tokens: u32,
    },
    #[error("reservation `{0}` was already settled or never existed")]
    ReservationNotFound(String),
    #[error("job `{0}` not found")]
    JobNotFound(String),
    #[error("invalid job transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: JobStatus, to: JobStatus, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl DispatchError {
    /// Stable machine-readable class used in logs and API payloads.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::NoCapableModel { .. } => "no_capable_model",
            Self::TemplateMissing { .. } => "template_missing",
            Self::TemplateParam { .. } => "template_param",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::JobNotFound(_) => "job_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidInput(_) => "invalid_input",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
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
            Self::QuotaExceeded { .. } => {
                "Your AI usage quota is exhausted for this period. Try again after the reset."
            }
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Conflict { .. } => "The resource is no longer in a state that allows this action.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::QuotaExceeded { .. } => 429,
            Self::Internal { .. } => 500,
            Self::ServiceUnavailable { .. } => 503,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::QuotaExceeded { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::QuotaExceeded { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
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
            | InterfaceError::QuotaExceeded { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
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
            ApplicationError::Dispatch(error) => {
                let message = error.to_string();
                match error {
                    DispatchError::NoCapableModel { .. }
                    | DispatchError::TemplateMissing { .. }
                    | DispatchError::TemplateParam { .. }
                    | DispatchError::InvalidInput(_) => Self::BadRequest { message, correlation_id },
                    DispatchError::QuotaExceeded { .. } => {
                        Self::QuotaExceeded { message, correlation_id }
                    }
                    DispatchError::JobNotFound(_) | DispatchError::ReservationNotFound(_) => {
                        Self::NotFound { message, correlation_id }
                    }
                    DispatchError::InvalidTransition { .. } => {
                        Self::Conflict { message, correlation_id }
                    }
                }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
