pub mod catalog;
pub mod config;
pub mod domain;
pub mod errors;
pub mod job_engine;
pub mod quota;
pub mod rate_limit;
pub mod registry;
pub mod results;
pub mod templates;

pub use domain::job::{
    AiOperationJob, EntityKind, JobError, JobErrorKind, JobId, JobStatus, JobTransitionEvent,
    OperationResult, TargetEntity,
};
pub use domain::operation::{Capability, OperationType};
pub use domain::provider::{Model, ModelId, Provider, ProviderId};
pub use domain::quota::{QuotaReservation, QuotaState, ReservationId, UserId};
pub use domain::template::{RenderedPrompt, Template};
pub use domain::usage::{UsageOutcome, UsageRecord, UsageRecordId, UsageSummary};
pub use errors::{ApplicationError, DispatchError, InterfaceError};
pub use job_engine::{JobEngine, JobEngineConfig};
pub use registry::{ModelSelection, ProviderRegistry};
pub use templates::TemplateStore;
