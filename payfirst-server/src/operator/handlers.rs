//! HTTP handlers for the operator API.
//!
//! Every handler except `/health` requires `Authorization: Bearer <token>`
//! matching OPERATOR_AUTH_TOKEN.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use payfirst_core::{
    FlagStatus, FlowVersion, GradualRollout, HealthSummary, ManualCompletion, NewPendingWork, PendingKind,
    PendingStats, PendingWork, PendingWorkId, RolloutFlag, SweepReport,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::repository::RepositoryError;
use crate::rollout::{RolloutController, RolloutError};
use crate::worker::WorkerError;
use crate::AppState;

/// Validate the authorization header against the operator auth token.
///
/// Returns `Ok(())` if authorized, or an error response if not.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    // No token configured: the operator API is disabled.
    let Some(expected_token) = auth_token else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Operator API is disabled (OPERATOR_AUTH_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(provided_token) if provided_token == expected_token => Ok(()),
            Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
            None => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header format. Expected: Bearer <token>",
            )
                .into_response()),
        },
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

#[allow(clippy::result_large_err)]
fn controller<'a>(state: &'a AppState, name: &str) -> Result<&'a Arc<RolloutController>, Response> {
    state
        .rollouts
        .get(name)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown flag: {name}")).into_response())
}

#[allow(clippy::result_large_err)]
fn parse_id(raw: &str) -> Result<PendingWorkId, Response> {
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid pending work id: {raw}")).into_response())
}

fn rollout_error(e: RolloutError) -> Response {
    match e {
        RolloutError::InvalidPercentage(_)
        | RolloutError::InvalidStep(_)
        | RolloutError::InvalidInterval(_) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        RolloutError::Unhealthy(_) => (StatusCode::CONFLICT, e.to_string()).into_response(),
        RolloutError::Repository(e) => repository_error(e),
    }
}

fn repository_error(e: RepositoryError) -> Response {
    match e {
        RepositoryError::DuplicatePayment { .. } => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        RepositoryError::InvalidRecord(_) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        other => {
            error!("Repository error in operator API: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "Storage error").into_response()
        }
    }
}

fn worker_error(e: WorkerError) -> Response {
    match e {
        WorkerError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        WorkerError::NotManuallyCompletable { .. } | WorkerError::Contended(_) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        WorkerError::Repository(e) => repository_error(e),
        WorkerError::Settlement(_) => {
            error!("Worker error in operator API: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Settlement error").into_response()
        }
    }
}

/// Strip the stored credential before a record leaves the process.
fn redacted(mut work: PendingWork) -> PendingWork {
    work.user_payload.credential.clear();
    work
}

#[derive(Debug, Deserialize)]
pub struct SetPercentageRequest {
    pub percentage: u32,
    #[serde(default)]
    pub changed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
    #[serde(default)]
    pub changed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    pub target: u32,
    pub step: u32,
    #[serde(default)]
    pub changed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub target: u32,
    pub step: u32,
    pub interval_secs: u64,
    #[serde(default)]
    pub changed_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TargetGroupsRequest {
    pub groups: Vec<String>,
    #[serde(default)]
    pub changed_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelScheduleResponse {
    pub cancelled: Option<GradualRollout>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub reason: String,
    #[serde(default)]
    pub changed_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RollbackResponse {
    /// False when the flag was already at 0%.
    pub rolled_back: bool,
    pub flag: RolloutFlag,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub user_key: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignResponse {
    pub flow: FlowVersion,
}

#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub success: bool,
    pub processing_time_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub id: PendingWorkId,
}

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    #[serde(default)]
    pub kind: Option<String>,
}

/// Handler: GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "payfirst"
    }))
}

/// Handler: GET /flags/:name
///
/// Flag with its full change history, current health and unhealthy streak.
pub async fn get_flag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<FlagStatus>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    Ok(Json(controller(&state, &name)?.status()))
}

/// Handler: GET /flags/:name/health
pub async fn get_flag_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<HealthSummary>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    Ok(Json(controller(&state, &name)?.health()))
}

/// Handler: PUT /flags/:name/percentage
pub async fn set_percentage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<SetPercentageRequest>,
) -> Result<Json<RolloutFlag>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let flag = controller(&state, &name)?
        .update_rollout(request.percentage, request.changed_by)
        .await
        .map_err(rollout_error)?;
    Ok(Json(flag))
}

/// Handler: PUT /flags/:name/enabled
pub async fn set_enabled(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<SetEnabledRequest>,
) -> Result<Json<RolloutFlag>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let flag = controller(&state, &name)?
        .set_enabled(request.enabled, request.changed_by)
        .await
        .map_err(rollout_error)?;
    Ok(Json(flag))
}

/// Handler: POST /flags/:name/advance
///
/// One step of a gradual rollout. 409 while the flag is unhealthy.
pub async fn advance_rollout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<AdvanceRequest>,
) -> Result<Json<RolloutFlag>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let flag = controller(&state, &name)?
        .advance_rollout(request.target, request.step, request.changed_by)
        .await
        .map_err(rollout_error)?;
    Ok(Json(flag))
}

/// Handler: POST /flags/:name/gradual
///
/// Take one step now and keep stepping every `interval_secs` until the target
/// is reached or the flag turns unhealthy.
pub async fn schedule_gradual_rollout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<FlagStatus>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let controller = controller(&state, &name)?;
    controller
        .schedule_gradual_rollout(
            request.target,
            request.step,
            request.interval_secs,
            request.changed_by,
        )
        .await
        .map_err(rollout_error)?;
    Ok(Json(controller.status()))
}

/// Handler: DELETE /flags/:name/gradual
pub async fn cancel_gradual_rollout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<CancelScheduleResponse>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let cancelled = controller(&state, &name)?.cancel_gradual_rollout();
    Ok(Json(CancelScheduleResponse { cancelled }))
}

/// Handler: PUT /flags/:name/target-groups
pub async fn set_target_groups(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<TargetGroupsRequest>,
) -> Result<Json<RolloutFlag>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let flag = controller(&state, &name)?
        .set_target_groups(request.groups, request.changed_by)
        .await
        .map_err(rollout_error)?;
    Ok(Json(flag))
}

/// Handler: POST /flags/:name/rollback
pub async fn rollback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<RollbackResponse>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    if request.reason.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "A rollback reason is required").into_response());
    }
    let controller = controller(&state, &name)?;
    let rolled_back = controller
        .emergency_rollback(&request.reason, request.changed_by)
        .await
        .map_err(rollout_error)?;
    Ok(Json(RollbackResponse {
        rolled_back,
        flag: controller.snapshot(),
    }))
}

/// Handler: POST /flags/:name/assign
///
/// Called by the registration flow to decide which flow a user gets.
pub async fn assign_flow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<AssignResponse>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let flow = controller(&state, &name)?.assign_flow(&request.user_key, &request.groups);
    Ok(Json(AssignResponse { flow }))
}

/// Handler: POST /flags/:name/outcomes
pub async fn record_outcome(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<OutcomeRequest>,
) -> Result<StatusCode, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    controller(&state, &name)?.record_outcome(request.success, request.processing_time_ms);
    Ok(StatusCode::NO_CONTENT)
}

/// Handler: POST /pending
///
/// Hand-off from the registration flow when payment succeeded but the
/// account could not be created inline.
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<NewPendingWork>,
) -> Result<(StatusCode, Json<EnqueueResponse>), Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let payment_id = request.payment_id.clone();
    let id = state.store.enqueue(request).await.map_err(repository_error)?;
    info!(id = %id, payment_id = %payment_id, "Enqueued pending registration");
    Ok((StatusCode::CREATED, Json(EnqueueResponse { id })))
}

/// Handler: GET /pending/stats
pub async fn pending_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PendingStats>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let stats = state.store.stats().await.map_err(repository_error)?;
    Ok(Json(stats))
}

/// Handler: GET /pending/failed?kind=
pub async fn list_failed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FailedQuery>,
) -> Result<Json<Vec<PendingWork>>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let kind = match query.kind.as_deref().filter(|k| !k.is_empty()) {
        Some(raw) => Some(
            raw.parse::<PendingKind>()
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?,
        ),
        None => None,
    };
    let failed = state
        .store
        .list_failed(kind)
        .await
        .map_err(repository_error)?;
    Ok(Json(failed.into_iter().map(redacted).collect()))
}

/// Handler: GET /pending/:id
pub async fn get_pending(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<PendingWork>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let id = parse_id(&id)?;
    match state.store.get(&id).await.map_err(repository_error)? {
        Some(work) => Ok(Json(redacted(work))),
        None => Err((StatusCode::NOT_FOUND, format!("Pending work {id} not found")).into_response()),
    }
}

/// Handler: POST /pending/:id/complete
pub async fn complete_pending(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ManualCompletion>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let id = parse_id(&id)?;
    let result = state
        .worker
        .complete_manually(&id)
        .await
        .map_err(worker_error)?;
    Ok(Json(result))
}

/// Handler: POST /sweep
///
/// Runs one sweep now. Safe alongside the interval loop.
pub async fn run_sweep(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, Response> {
    validate_auth(&headers, &state.operator_auth_token)?;
    let report = state.worker.run_sweep().await.map_err(worker_error)?;
    info!("Triggered sweep finished: {}", report.message());
    Ok(Json(report))
}
