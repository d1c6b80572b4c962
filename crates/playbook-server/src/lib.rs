// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API server for the playbook orchestration engine.
//!
//! Exposes the run query/control surface over axum:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET    | `/health` | Liveness (exempt from auth) |
//! | POST   | `/api/v1/definitions` | Publish a workflow definition |
//! | POST   | `/api/v1/runs` | Start a run (optional `Idempotency-Key`) |
//! | GET    | `/api/v1/runs` | List runs with filters |
//! | GET    | `/api/v1/runs/{id}` | Enriched run detail |
//! | PUT    | `/api/v1/runs/{id}` | Pause / resume / update priority |
//! | DELETE | `/api/v1/runs/{id}` | Cancel |
//! | POST   | `/api/v1/runs/{id}/steps/{step_id}/complete` | Complete a suspended step |
//! | POST   | `/api/v1/runs/{id}/steps/{step_id}/timeout` | Scheduler timeout re-entry |
//! | GET    | `/api/v1/audit` | Audit retrieval (management) |
//!
//! Authentication is out of scope: an upstream gateway resolves the caller
//! and forwards `X-Auth-User-Id` / `X-Auth-Organization-Id`; this server
//! resolves the permission set from entity data per request.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use playbook_core::audit::AuditService;
use playbook_core::engine::WorkflowEngine;
use playbook_core::error::EngineError;
use playbook_core::idempotency::IdempotencyService;
use playbook_core::runs::RunControlService;
use playbook_core::security::PermissionService;
use playbook_core::store::Store;

pub mod auth;
pub mod external_http;
pub mod routes;

/// Shared state for all handlers.
pub struct AppState {
    /// The generic persistent store.
    pub store: Arc<dyn Store>,
    /// The workflow engine.
    pub engine: Arc<WorkflowEngine>,
    /// Run query/control service.
    pub control: RunControlService,
    /// Permission resolution.
    pub permissions: PermissionService,
    /// Request dedup.
    pub idempotency: IdempotencyService,
    /// Audit trail access.
    pub audit: AuditService,
    /// Server start time (for uptime reporting).
    pub started_at: Instant,
    /// Server version string.
    pub version: String,
}

impl AppState {
    /// Wire the full service stack over a store and engine.
    pub fn new(store: Arc<dyn Store>, engine: Arc<WorkflowEngine>, idempotency_ttl_hours: i64) -> Self {
        Self {
            control: RunControlService::new(store.clone(), engine.clone()),
            permissions: PermissionService::new(store.clone()),
            idempotency: IdempotencyService::new(store.clone(), idempotency_ttl_hours),
            audit: AuditService::new(store.clone()),
            store,
            engine,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }
}

/// JSON error envelope with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Build an error response directly.
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Map an engine error to its HTTP representation.
    ///
    /// Store-adapter detail is exposed only when `sensitive_ok` (the caller
    /// holds the elevated read permission); everyone else gets a generic
    /// message.
    pub fn from_engine(error: &EngineError, sensitive_ok: bool) -> Self {
        let message = if error.is_sensitive() && !sensitive_ok {
            "internal error".to_string()
        } else {
            error.to_string()
        };
        Self {
            status: status_for(error.error_code()),
            code: error.error_code().to_string(),
            message,
        }
    }
}

/// HTTP status for a stable engine error code.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
        "FORBIDDEN" => StatusCode::FORBIDDEN,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "CONFLICT" => StatusCode::CONFLICT,
        "INVALID_STATUS" | "INVALID_ACTION" | "ALREADY_CANCELLED" | "VALIDATION_ERROR"
        | "GUARDRAIL_VIOLATION" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(serde_json::json!({
                "code": self.code,
                "message": self.message,
            })),
        )
            .into_response()
    }
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/v1/definitions", post(routes::publish_definition))
        .route("/api/v1/runs", post(routes::start_run).get(routes::list_runs))
        .route(
            "/api/v1/runs/{id}",
            get(routes::get_run)
                .put(routes::update_run)
                .delete(routes::cancel_run),
        )
        .route(
            "/api/v1/runs/{id}/steps/{step_id}/complete",
            post(routes::complete_step),
        )
        .route(
            "/api/v1/runs/{id}/steps/{step_id}/timeout",
            post(routes::step_timeout),
        )
        .route("/api/v1/audit", get(routes::query_audit))
        .fallback(routes::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
