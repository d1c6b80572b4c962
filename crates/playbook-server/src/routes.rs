// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP route handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::instrument;
use uuid::Uuid;

use playbook_core::audit::{AuditFilter, AuditOutcome};
use playbook_core::definition::WorkflowDefinition;
use playbook_core::engine::RunStatus;
use playbook_core::idempotency::CachedResponse;
use playbook_core::runs::{
    MANAGE_PERMISSION, READ_SENSITIVE_PERMISSION, RunControlAction, RunListFilter, RunQueryOptions,
};
use playbook_core::security::SecurityContext;

use crate::auth::Auth;
use crate::{ApiError, AppState, status_for};

/// Header carrying the optional idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
/// Response header marking a replayed response.
pub const IDEMPOTENCY_CACHED_HEADER: &str = "x-idempotency-cached";

fn engine_err(ctx: &SecurityContext) -> impl Fn(playbook_core::error::EngineError) -> ApiError + '_ {
    move |e| ApiError::from_engine(&e, ctx.holds(READ_SENSITIVE_PERMISSION))
}

/// Fallback handler for unmatched routes.
pub async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "not found")
}

/// GET /health (exempt from auth)
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_healthy = state.store.health_check().await.unwrap_or(false);
    let status = if store_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "healthy": store_healthy,
            "version": state.version,
            "uptime_ms": state.uptime_ms(),
        })),
    )
}

// ============================================================================
// Definitions
// ============================================================================

/// POST /api/v1/definitions
#[instrument(skip_all)]
pub async fn publish_definition(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let definition = WorkflowDefinition::parse(&body).map_err(|e| engine_err(&ctx)(e))?;
    let definition_id = state
        .engine
        .publish_definition(ctx.organization_id, &definition, &ctx)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "definition_id": definition_id })),
    )
        .into_response())
}

// ============================================================================
// Runs
// ============================================================================

/// Request body for starting a run.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunRequest {
    /// Definition to execute.
    pub definition_id: Uuid,
    /// Trigger-supplied variables.
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// POST /api/v1/runs
///
/// An optional `Idempotency-Key` header deduplicates retries; omission
/// disables dedup for the call.
#[instrument(skip_all, fields(user_id = %ctx.user_id))]
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    headers: HeaderMap,
    Json(body): Json<StartRunRequest>,
) -> Result<Response, ApiError> {
    // Permission failures are raised before the idempotency machinery so a
    // denial is never cached against the caller's key
    if !ctx.holds(playbook_core::engine::EXECUTE_PERMISSION) {
        let _ = state
            .audit
            .record(
                ctx.organization_id,
                ctx.user_id,
                "run.start",
                &body.definition_id.to_string(),
                playbook_core::audit::AuditOutcome::Denied,
                json!({}),
            )
            .await;
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            format!(
                "Missing required permission '{}'",
                playbook_core::engine::EXECUTE_PERMISSION
            ),
        ));
    }

    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body_value = serde_json::to_value(&body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()))?;

    let engine = state.engine.clone();
    let run_ctx = ctx.clone();
    let definition_id = body.definition_id;
    let variables = body.variables.clone();

    let outcome = state
        .idempotency
        .process(
            ctx.organization_id,
            key.as_deref(),
            "start_run",
            &body_value,
            move || async move {
                let run = engine
                    .start(run_ctx.organization_id, definition_id, variables, &run_ctx)
                    .await?;
                Ok(CachedResponse {
                    status_code: StatusCode::CREATED.as_u16(),
                    body: json!({
                        "run_id": run.id,
                        "status": run.status.as_str(),
                    }),
                })
            },
        )
        .await
        .map_err(|e| engine_err(&ctx)(e))?;

    if outcome.cached {
        let _ = state
            .audit
            .record(
                ctx.organization_id,
                ctx.user_id,
                "run.start",
                &body.definition_id.to_string(),
                playbook_core::audit::AuditOutcome::Success,
                json!({ "replayed": true, "idempotency_key": key }),
            )
            .await;
    }

    // Replayed failures carry no status code; map their stored error code
    let status = if outcome.status_code == 0 {
        status_for(
            outcome
                .response
                .get("code")
                .and_then(|c| c.as_str())
                .unwrap_or(""),
        )
    } else {
        StatusCode::from_u16(outcome.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    };

    let mut response = (status, Json(outcome.response)).into_response();
    response.headers_mut().insert(
        IDEMPOTENCY_CACHED_HEADER,
        if outcome.cached { "true" } else { "false" }.parse().unwrap(),
    );
    Ok(response)
}

/// Query parameters for run listings.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    /// Filter by status.
    pub status: Option<String>,
    /// Filter by definition.
    pub definition_id: Option<Uuid>,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Page offset.
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/v1/runs
#[instrument(skip_all)]
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Query(query): Query<ListRunsQuery>,
) -> Result<Response, ApiError> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let filter = RunListFilter {
        status,
        definition_id: query.definition_id,
    };
    let (runs, total) = state
        .control
        .list_runs(&filter, query.limit, query.offset, &ctx)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;
    Ok(Json(json!({
        "runs": runs,
        "total": total,
        "limit": query.limit,
        "offset": query.offset,
    }))
    .into_response())
}

/// Query parameters for run detail.
#[derive(Debug, Deserialize)]
pub struct GetRunQuery {
    /// Include step executions (default true).
    #[serde(default = "default_true")]
    pub include_steps: bool,
    /// Also include per-step outputs.
    #[serde(default)]
    pub include_step_detail: bool,
    /// Include the run log.
    #[serde(default)]
    pub include_logs: bool,
    /// Include performance metrics.
    #[serde(default)]
    pub include_metrics: bool,
    /// Include the derived timeline.
    #[serde(default)]
    pub include_timeline: bool,
    /// Cap on returned step executions.
    #[serde(default = "default_step_limit")]
    pub step_limit: i64,
    /// Only log entries at this level.
    pub log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_step_limit() -> i64 {
    100
}

/// GET /api/v1/runs/{id}
#[instrument(skip_all, fields(run_id = %id))]
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<Uuid>,
    Query(query): Query<GetRunQuery>,
) -> Result<Response, ApiError> {
    let options = RunQueryOptions {
        include_steps: query.include_steps,
        include_step_detail: query.include_step_detail,
        include_logs: query.include_logs,
        include_metrics: query.include_metrics,
        include_timeline: query.include_timeline,
        step_limit: query.step_limit,
        log_level: query.log_level,
    };
    let detail = state
        .control
        .get_run(id, &options, &ctx)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;
    Ok(Json(detail).into_response())
}

/// Request body for run updates.
#[derive(Debug, Deserialize)]
pub struct UpdateRunRequest {
    /// One of `pause`, `resume`, `update_priority`.
    pub action: String,
    /// New priority for `update_priority`.
    pub priority: Option<String>,
}

/// PUT /api/v1/runs/{id}
#[instrument(skip_all, fields(run_id = %id))]
pub async fn update_run(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRunRequest>,
) -> Result<Response, ApiError> {
    let action = match body.action.as_str() {
        "pause" => RunControlAction::Pause,
        "resume" => RunControlAction::Resume,
        "update_priority" => {
            let priority = body.priority.ok_or_else(|| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "VALIDATION_ERROR",
                    "update_priority requires a 'priority' field",
                )
            })?;
            RunControlAction::UpdatePriority(priority)
        }
        other => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ACTION",
                format!("unknown run action '{}'", other),
            ));
        }
    };

    let run = state
        .control
        .update_run(id, action, &ctx)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;
    Ok(Json(json!({ "run": run })).into_response())
}

/// Optional request body for cancellation.
#[derive(Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    /// Reason recorded on the run.
    pub reason: Option<String>,
}

/// DELETE /api/v1/runs/{id}
#[instrument(skip_all, fields(run_id = %id))]
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRunRequest>>,
) -> Result<Response, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    let run = state
        .control
        .cancel_run(id, reason, &ctx)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;
    Ok(Json(json!({ "run": run })).into_response())
}

/// Request body for completing a suspended step.
#[derive(Debug, Default, Deserialize)]
pub struct CompleteStepRequest {
    /// Outputs merged into instance variables.
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// POST /api/v1/runs/{id}/steps/{step_id}/complete
#[instrument(skip_all, fields(run_id = %id, step_id = %step_id))]
pub async fn complete_step(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path((id, step_id)): Path<(Uuid, String)>,
    body: Option<Json<CompleteStepRequest>>,
) -> Result<Response, ApiError> {
    let outputs = body.map(|Json(b)| b.outputs).unwrap_or_default();
    let run = state
        .engine
        .complete_step(ctx.organization_id, id, &step_id, outputs, &ctx)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;
    Ok(Json(json!({
        "run_id": run.id,
        "status": run.status.as_str(),
        "current_step_id": run.current_step_id,
    }))
    .into_response())
}

/// POST /api/v1/runs/{id}/steps/{step_id}/timeout
///
/// Entry point for the external time-based trigger: the engine does not
/// poll for step timeouts itself.
#[instrument(skip_all, fields(run_id = %id, step_id = %step_id))]
pub async fn step_timeout(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path((id, step_id)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    if !ctx.holds(MANAGE_PERMISSION) && !ctx.holds(playbook_core::engine::EXECUTE_PERMISSION) {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "timeout delivery requires execute or manage permission",
        ));
    }
    let run = state
        .engine
        .handle_timeout(ctx.organization_id, id, &step_id)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;
    Ok(Json(json!({
        "run_id": run.id,
        "status": run.status.as_str(),
        "current_step_id": run.current_step_id,
    }))
    .into_response())
}

// ============================================================================
// Audit
// ============================================================================

/// Query parameters for audit retrieval.
#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    /// Filter by acting user.
    pub actor_id: Option<Uuid>,
    /// Filter by action name.
    pub action: Option<String>,
    /// Filter by outcome (`success`, `denied`, `failure`).
    pub outcome: Option<String>,
    /// Only records at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Page offset.
    #[serde(default)]
    pub offset: i64,
}

/// GET /api/v1/audit (management permission)
#[instrument(skip_all)]
pub async fn query_audit(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Query(query): Query<AuditQuery>,
) -> Result<Response, ApiError> {
    if !ctx.holds(MANAGE_PERMISSION) && !ctx.holds(READ_SENSITIVE_PERMISSION) {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            format!("audit retrieval requires '{}'", MANAGE_PERMISSION),
        ));
    }

    let outcome = query.outcome.as_deref().map(parse_outcome).transpose()?;
    let filter = AuditFilter {
        actor_id: query.actor_id,
        action: query.action.clone(),
        outcome,
        since: query.since,
    };
    let events = state
        .audit
        .query(ctx.organization_id, &filter, query.limit, query.offset)
        .await
        .map_err(|e| engine_err(&ctx)(e))?;

    let events: Vec<Value> = events
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "actor_id": e.actor_id,
                "action": e.action,
                "resource": e.resource,
                "outcome": e.outcome,
                "context": e.context,
                "recorded_at": e.recorded_at,
            })
        })
        .collect();
    Ok(Json(json!({ "events": events })).into_response())
}

// ============================================================================
// Parsers
// ============================================================================

fn parse_status(raw: &str) -> Result<RunStatus, ApiError> {
    match raw {
        "running" => Ok(RunStatus::Running),
        "paused" => Ok(RunStatus::Paused),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            format!("unknown status '{}'", other),
        )),
    }
}

fn parse_outcome(raw: &str) -> Result<AuditOutcome, ApiError> {
    match raw {
        "success" => Ok(AuditOutcome::Success),
        "denied" => Ok(AuditOutcome::Denied),
        "failure" => Ok(AuditOutcome::Failure),
        other => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            format!("unknown outcome '{}'", other),
        )),
    }
}
