//! JSON API over the dispatcher.
//!
//! - `POST /api/ai/jobs`                admit an operation, returns 202 with the job
//! - `GET  /api/ai/jobs/{id}`           poll a job
//! - `POST /api/ai/jobs/{id}/cancel`    cancel a queued job or flag a running one
//! - `GET  /api/ai/quota/{user_id}`     current period usage and limits
//! - `GET  /api/ai/usage/{user_id}`     most recent usage records

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use noteflow_agent::Dispatcher;
use noteflow_core::domain::job::{
    AiOperationJob, EntityKind, JobError, JobId, JobStatus, OperationResult, TargetEntity,
};
use noteflow_core::domain::operation::OperationType;
use noteflow_core::domain::quota::{QuotaState, UserId};
use noteflow_core::domain::usage::UsageRecord;
use noteflow_core::errors::{ApplicationError, InterfaceError};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

const DEFAULT_USAGE_LIMIT: u32 = 50;
const MAX_USAGE_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct ApiState {
    dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub user_id: String,
    pub target_type: String,
    pub target_id: String,
    pub operation: String,
    pub input_text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub operation: String,
    pub target_type: String,
    pub target_id: String,
    pub model_id: String,
    pub attempt_count: u32,
    pub cancel_requested: bool,
    pub result: Option<OperationResult>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<AiOperationJob> for JobResponse {
    fn from(job: AiOperationJob) -> Self {
        Self {
            id: job.id.0,
            status: job.status,
            operation: job.operation.as_str().to_string(),
            target_type: job.target.kind.as_str().to_string(),
            target_id: job.target.id,
            model_id: job.model_id.0,
            attempt_count: job.attempt_count,
            cancel_requested: job.cancel_requested,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaResponse {
    pub user_id: String,
    pub max_requests: u32,
    pub max_tokens: u32,
    pub used_requests: u32,
    pub used_tokens: u32,
    pub reserved_requests: u32,
    pub reserved_tokens: u32,
    pub requests_remaining: u32,
    pub tokens_remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl From<QuotaState> for QuotaResponse {
    fn from(state: QuotaState) -> Self {
        Self {
            requests_remaining: state.requests_remaining(),
            tokens_remaining: state.tokens_remaining(),
            user_id: state.user_id.0,
            max_requests: state.max_requests,
            max_tokens: state.max_tokens,
            used_requests: state.used_requests,
            used_tokens: state.used_tokens,
            reserved_requests: state.reserved_requests,
            reserved_tokens: state.reserved_tokens,
            reset_at: state.reset_at,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct UsageQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub user_id: String,
    pub records: Vec<UsageRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/api/ai/jobs", post(dispatch_job))
        .route("/api/ai/jobs/{id}", get(get_job))
        .route("/api/ai/jobs/{id}/cancel", post(cancel_job))
        .route("/api/ai/quota/{user_id}", get(get_quota))
        .route("/api/ai/usage/{user_id}", get(list_usage))
        .with_state(ApiState { dispatcher })
}

async fn dispatch_job(
    State(state): State<ApiState>,
    Json(request): Json<DispatchRequest>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let correlation_id = correlation_id();
    let operation = OperationType::parse(&request.operation).ok_or_else(|| {
        bad_request(format!("unknown operation `{}`", request.operation), &correlation_id)
    })?;
    let kind = EntityKind::parse(&request.target_type).ok_or_else(|| {
        bad_request(
            format!("unknown target type `{}` (expected note|task)", request.target_type),
            &correlation_id,
        )
    })?;

    let job = state
        .dispatcher
        .dispatch(
            &UserId(request.user_id),
            TargetEntity { kind, id: request.target_id },
            operation,
            &request.input_text,
        )
        .await
        .map_err(|error| application_error(error, &correlation_id))?;

    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

async fn get_job(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<JobResponse>> {
    let correlation_id = correlation_id();
    let job = state
        .dispatcher
        .get_job(&JobId(id))
        .await
        .map_err(|error| application_error(error, &correlation_id))?;
    Ok(Json(job.into()))
}

async fn cancel_job(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<JobResponse>> {
    let correlation_id = correlation_id();
    let job = state
        .dispatcher
        .cancel(&JobId(id))
        .await
        .map_err(|error| application_error(error, &correlation_id))?;
    Ok(Json(job.into()))
}

async fn get_quota(
    Path(user_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<Json<QuotaResponse>> {
    let correlation_id = correlation_id();
    let quota = state
        .dispatcher
        .get_quota_state(&UserId(user_id))
        .await
        .map_err(|error| application_error(error, &correlation_id))?;
    Ok(Json(quota.into()))
}

async fn list_usage(
    Path(user_id): Path<String>,
    State(state): State<ApiState>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<UsageResponse>> {
    let correlation_id = correlation_id();
    let limit = query.limit.unwrap_or(DEFAULT_USAGE_LIMIT).clamp(1, MAX_USAGE_LIMIT);
    let user_id = UserId(user_id);
    let records = state
        .dispatcher
        .recent_usage(&user_id, limit)
        .await
        .map_err(|error| application_error(error, &correlation_id))?;
    Ok(Json(UsageResponse { user_id: user_id.0, records }))
}

fn correlation_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

fn bad_request(message: String, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    interface_error(InterfaceError::BadRequest {
        message,
        correlation_id: correlation_id.to_string(),
    })
}

fn application_error(error: ApplicationError, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    interface_error(error.into_interface(correlation_id))
}

fn interface_error(error: InterfaceError) -> (StatusCode, Json<ApiError>) {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(
            event_name = "api.request.failed",
            correlation_id = error.correlation_id(),
            error = %error,
            "request failed"
        );
    } else {
        warn!(
            event_name = "api.request.rejected",
            correlation_id = error.correlation_id(),
            status = status.as_u16(),
            error = %error,
            "request rejected"
        );
    }

    // Internal detail stays in the log for 5xx responses.
    let message = if status.is_server_error() {
        error.user_message().to_string()
    } else {
        error.message().to_string()
    };
    (
        status,
        Json(ApiError {
            error: error.user_message().to_string(),
            message,
            correlation_id: error.correlation_id().to_string(),
        }),
    )
}
