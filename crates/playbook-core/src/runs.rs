// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run query and control surface.
//!
//! Read-enriched run detail (progress, ETA, logs, metrics, timeline,
//! permitted actions) plus pause/resume/priority control and cancellation.
//! Every control action re-checks permissions and is audited.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Map;
use tracing::instrument;
use uuid::Uuid;

use crate::audit::{AuditOutcome, AuditService};
use crate::engine::{
    EVENT_TRANSACTION_TYPE, INSTANCE_TRANSACTION_TYPE, RunRecord, RunStatus,
    STEP_TRANSACTION_TYPE, StepExecutionRecord, StepStatus, WorkflowEngine,
};
use crate::error::{EngineError, Result};
use crate::security::{PermissionScope, PermissionService, SecurityContext};
use crate::store::{Store, TransactionFilter, TransactionRecord};

/// Permission to read runs (initiators can always read their own).
pub const READ_PERMISSION: &str = "playbook_run:read";
/// Permission to cancel runs other than one's own.
pub const CANCEL_PERMISSION: &str = "playbook_run:cancel";
/// Management permission: pause/resume/priority and full visibility.
pub const MANAGE_PERMISSION: &str = "playbook_run:manage";
/// Elevated permission exposing store-adapter error detail.
pub const READ_SENSITIVE_PERMISSION: &str = "playbook:read_sensitive";

/// Recognized priority labels.
const PRIORITIES: &[&str] = &["low", "normal", "high", "urgent"];

/// Options for run detail queries.
#[derive(Debug, Clone)]
pub struct RunQueryOptions {
    /// Include step execution rows (default true).
    pub include_steps: bool,
    /// Also include per-step outputs recorded on the rows.
    pub include_step_detail: bool,
    /// Include the run event log.
    pub include_logs: bool,
    /// Include computed performance metrics.
    pub include_metrics: bool,
    /// Include the derived timeline.
    pub include_timeline: bool,
    /// Cap on returned step executions.
    pub step_limit: i64,
    /// Only log entries at this level.
    pub log_level: Option<String>,
}

impl Default for RunQueryOptions {
    fn default() -> Self {
        Self {
            include_steps: true,
            include_step_detail: false,
            include_logs: false,
            include_metrics: false,
            include_timeline: false,
            step_limit: 100,
            log_level: None,
        }
    }
}

/// API-facing run summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run id.
    pub id: Uuid,
    /// Definition the run executes.
    pub definition_id: Uuid,
    /// Run status string.
    pub status: RunStatus,
    /// Step the run is at.
    pub current_step_id: Option<String>,
    /// Instance variables.
    pub variables: serde_json::Value,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// The user who started the run.
    pub started_by: Uuid,
    /// Priority label.
    pub priority: String,
    /// Failure message, if failed.
    pub error: Option<String>,
}

impl From<&RunRecord> for RunSummary {
    fn from(run: &RunRecord) -> Self {
        Self {
            id: run.id,
            definition_id: run.definition_id,
            status: run.status,
            current_step_id: run.current_step_id.clone(),
            variables: serde_json::Value::Object(run.variables.clone()),
            started_at: run.started_at,
            completed_at: run.completed_at,
            started_by: run.started_by,
            priority: run.priority.clone(),
            error: run.error.clone(),
        }
    }
}

/// One step execution row as exposed by the API.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    /// Row id.
    pub id: Uuid,
    /// Step id within the definition.
    pub step_id: String,
    /// Step kind tag.
    pub step_type: String,
    /// Top-level step sequence.
    pub sequence: usize,
    /// Branch id for parallel rows.
    pub branch: Option<String>,
    /// Iteration index for loop rows.
    pub iteration: Option<usize>,
    /// Execution status.
    pub status: StepStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds, when finished.
    pub duration_ms: Option<i64>,
    /// Error, if failed.
    pub error: Option<String>,
    /// Outputs recorded on the row, when step detail is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
}

/// Progress projection for a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    /// Top-level steps that reached completed or skipped.
    pub completed_steps: usize,
    /// Total top-level steps in the definition.
    pub total_steps: usize,
    /// Completion ratio in percent.
    pub percent: f64,
    /// Extrapolated seconds remaining; `None` while progress is zero or
    /// the run is finished.
    pub eta_seconds: Option<i64>,
}

/// One run log entry.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry {
    /// Log level.
    pub level: String,
    /// Message text.
    pub message: String,
    /// Step the entry belongs to, when applicable.
    pub step_id: Option<String>,
    /// When the entry was recorded.
    pub at: DateTime<Utc>,
}

/// Per-step duration metric.
#[derive(Debug, Clone, Serialize)]
pub struct StepDuration {
    /// Step id.
    pub step_id: String,
    /// Duration in milliseconds.
    pub duration_ms: i64,
}

/// Computed performance metrics for a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    /// Wall-clock seconds since the run started (to completion if done).
    pub elapsed_seconds: i64,
    /// Durations of finished step attempts.
    pub step_durations: Vec<StepDuration>,
    /// Mean step duration in milliseconds.
    pub average_step_ms: Option<i64>,
}

/// One timeline entry.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    /// When the event happened.
    pub at: DateTime<Utc>,
    /// Event description.
    pub event: String,
}

/// Actions the caller is allowed to take on the run.
#[derive(Debug, Clone, Serialize)]
pub struct PermittedActions {
    /// May cancel the run.
    pub can_cancel: bool,
    /// May start a fresh run of the same definition.
    pub can_retry: bool,
    /// May read the run log.
    pub can_view_logs: bool,
    /// May pause/resume or change priority.
    pub can_modify: bool,
}

/// Enriched run detail.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    /// The run.
    pub run: RunSummary,
    /// Name of the owning definition.
    pub definition_name: String,
    /// Progress projection.
    pub progress: RunProgress,
    /// Step execution rows, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepView>>,
    /// Run log, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<RunLogEntry>>,
    /// Performance metrics, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RunMetrics>,
    /// Derived timeline, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Vec<TimelineEntry>>,
    /// The caller's permitted actions.
    pub permitted_actions: PermittedActions,
}

/// Control actions on a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunControlAction {
    /// `running` → `paused`.
    Pause,
    /// `paused` → `running` (re-enters the engine).
    Resume,
    /// Change the priority label.
    UpdatePriority(String),
}

impl RunControlAction {
    fn verb(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::UpdatePriority(_) => "update priority of",
        }
    }
}

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunListFilter {
    /// Filter by status.
    pub status: Option<RunStatus>,
    /// Filter by definition.
    pub definition_id: Option<Uuid>,
}

/// Run query/control service.
pub struct RunControlService {
    store: Arc<dyn Store>,
    engine: Arc<WorkflowEngine>,
    permissions: PermissionService,
    audit: AuditService,
}

impl RunControlService {
    /// Create a new control service sharing the engine's store.
    pub fn new(store: Arc<dyn Store>, engine: Arc<WorkflowEngine>) -> Self {
        Self {
            permissions: PermissionService::new(store.clone()),
            audit: AuditService::new(store.clone()),
            store,
            engine,
        }
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// Enriched run detail, permission-gated.
    #[instrument(skip(self, options, ctx), fields(run_id = %run_id))]
    pub async fn get_run(
        &self,
        run_id: Uuid,
        options: &RunQueryOptions,
        ctx: &SecurityContext,
    ) -> Result<RunDetail> {
        let run = self.engine.load_run(ctx.organization_id, run_id).await?;
        let definition = self
            .engine
            .load_definition(ctx.organization_id, run.definition_id)
            .await?;

        let scope = PermissionScope {
            resource_owner_id: Some(run.started_by),
            department: None,
        };
        if !self.permissions.check_permission(ctx, READ_PERMISSION, Some(&scope))
            && !ctx.holds(MANAGE_PERMISSION)
        {
            return Err(EngineError::Forbidden {
                permission: READ_PERMISSION.to_string(),
            });
        }

        let step_rows = self
            .step_rows(ctx.organization_id, run_id, options.step_limit)
            .await?;

        let completed_steps = count_completed_top_level(&step_rows);
        let total_steps = definition.total_steps();
        let progress = project_progress(&run, completed_steps, total_steps);

        let steps = options.include_steps.then(|| {
            step_rows
                .iter()
                .map(|(record, row)| step_view(record, row, options.include_step_detail))
                .collect::<Vec<_>>()
        });

        let logs = if options.include_logs {
            Some(
                self.run_logs(ctx.organization_id, run_id, options.log_level.as_deref())
                    .await?,
            )
        } else {
            None
        };

        let metrics = options
            .include_metrics
            .then(|| compute_metrics(&run, &step_rows));

        let timeline = options
            .include_timeline
            .then(|| build_timeline(&run, &step_rows));

        let permitted_actions = self.permitted_actions(&run, ctx);

        Ok(RunDetail {
            run: RunSummary::from(&run),
            definition_name: definition.name,
            progress,
            steps,
            logs,
            metrics,
            timeline,
            permitted_actions,
        })
    }

    /// List runs with filters and pagination, newest last.
    pub async fn list_runs(
        &self,
        filter: &RunListFilter,
        limit: i64,
        offset: i64,
        ctx: &SecurityContext,
    ) -> Result<(Vec<RunSummary>, i64)> {
        if !ctx.holds(READ_PERMISSION) && !ctx.holds(MANAGE_PERMISSION) {
            return Err(EngineError::Forbidden {
                permission: READ_PERMISSION.to_string(),
            });
        }

        let mut metadata = Map::new();
        if let Some(status) = filter.status {
            metadata.insert("status".to_string(), serde_json::json!(status.as_str()));
        }
        if let Some(definition_id) = filter.definition_id {
            metadata.insert("definition_id".to_string(), serde_json::json!(definition_id));
        }

        let txn_filter = TransactionFilter {
            transaction_type: Some(INSTANCE_TRANSACTION_TYPE.to_string()),
            metadata_contains: if metadata.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(metadata))
            },
            ..Default::default()
        };

        let total = self
            .store
            .count_transactions(ctx.organization_id, &txn_filter)
            .await?;
        let rows = self
            .store
            .query_transactions(ctx.organization_id, &txn_filter, limit, offset)
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(RunSummary::from(&RunRecord::from_transaction(row)?));
        }
        Ok((runs, total))
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Pause, resume, or reprioritize a run (management permission only).
    ///
    /// Transition legality is validated against the current status before
    /// anything is applied; illegal transitions are a typed
    /// `INVALID_STATUS` error, not a silent no-op.
    #[instrument(skip(self, ctx), fields(run_id = %run_id))]
    pub async fn update_run(
        &self,
        run_id: Uuid,
        action: RunControlAction,
        ctx: &SecurityContext,
    ) -> Result<RunSummary> {
        if !ctx.holds(MANAGE_PERMISSION) {
            self.audit_denied(ctx, "run.update", run_id, MANAGE_PERMISSION)
                .await;
            return Err(EngineError::Forbidden {
                permission: MANAGE_PERMISSION.to_string(),
            });
        }

        let mut run = self.engine.load_run(ctx.organization_id, run_id).await?;

        match &action {
            RunControlAction::Pause => {
                if run.status != RunStatus::Running {
                    return Err(invalid_status(&run, action.verb()));
                }
                run.status = RunStatus::Paused;
            }
            RunControlAction::Resume => {
                if run.status != RunStatus::Paused {
                    return Err(invalid_status(&run, action.verb()));
                }
                run.status = RunStatus::Running;
            }
            RunControlAction::UpdatePriority(priority) => {
                if run.status.is_terminal() {
                    return Err(invalid_status(&run, action.verb()));
                }
                if !PRIORITIES.contains(&priority.as_str()) {
                    return Err(EngineError::Validation {
                        field: "priority".to_string(),
                        message: format!("unknown priority '{}'", priority),
                    });
                }
                run.priority = priority.clone();
            }
        }

        self.store
            .update_transaction(ctx.organization_id, run.id, &run.to_metadata()?)
            .await?;

        self.audit_success(
            ctx,
            "run.update",
            run_id,
            serde_json::json!({ "action": action.verb(), "status": run.status.as_str() }),
        )
        .await;

        // A resumed run re-enters the engine from its persisted step
        if action == RunControlAction::Resume {
            let resumed = self.engine.advance(ctx.organization_id, run_id).await?;
            return Ok(RunSummary::from(&resumed));
        }
        Ok(RunSummary::from(&run))
    }

    /// Cancel a run.
    ///
    /// Allowed for the run's initiator or a caller holding the cancel or
    /// management permission. Already-cancelled runs are distinguished from
    /// finished ones (`ALREADY_CANCELLED` vs `INVALID_STATUS`).
    #[instrument(skip(self, ctx), fields(run_id = %run_id))]
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        reason: Option<String>,
        ctx: &SecurityContext,
    ) -> Result<RunSummary> {
        let mut run = self.engine.load_run(ctx.organization_id, run_id).await?;

        let is_initiator = run.started_by == ctx.user_id;
        if !is_initiator && !ctx.holds(CANCEL_PERMISSION) && !ctx.holds(MANAGE_PERMISSION) {
            self.audit_denied(ctx, "run.cancel", run_id, CANCEL_PERMISSION)
                .await;
            return Err(EngineError::Forbidden {
                permission: CANCEL_PERMISSION.to_string(),
            });
        }

        match run.status {
            RunStatus::Cancelled => {
                return Err(EngineError::AlreadyCancelled {
                    run_id: run_id.to_string(),
                });
            }
            RunStatus::Completed | RunStatus::Failed => {
                return Err(invalid_status(&run, "cancel"));
            }
            RunStatus::Running | RunStatus::Paused => {}
        }

        run.status = RunStatus::Cancelled;
        run.completed_at = Some(Utc::now());
        if let Some(ref reason) = reason {
            run.error = Some(reason.clone());
        }

        let metadata = run.to_metadata()?;
        if let Err(e) = self
            .store
            .update_transaction(ctx.organization_id, run.id, &metadata)
            .await
        {
            self.audit_failure(ctx, "run.cancel", run_id, &e).await;
            return Err(EngineError::CancellationFailed {
                run_id: run_id.to_string(),
                details: e.to_string(),
            });
        }

        self.audit_success(
            ctx,
            "run.cancel",
            run_id,
            serde_json::json!({ "reason": reason }),
        )
        .await;
        Ok(RunSummary::from(&run))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn step_rows(
        &self,
        organization_id: Uuid,
        run_id: Uuid,
        limit: i64,
    ) -> Result<Vec<(StepExecutionRecord, TransactionRecord)>> {
        let rows = self
            .store
            .query_transactions(
                organization_id,
                &TransactionFilter {
                    transaction_type: Some(STEP_TRANSACTION_TYPE.to_string()),
                    metadata_contains: Some(serde_json::json!({ "instance_id": run_id })),
                    ..Default::default()
                },
                limit,
                0,
            )
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push((StepExecutionRecord::from_transaction(&row)?, row));
        }
        // Strict step-sequence ordering, attempts in creation order within
        records.sort_by(|(a, _), (b, _)| {
            a.sequence
                .cmp(&b.sequence)
                .then(a.started_at.cmp(&b.started_at))
        });
        Ok(records)
    }

    async fn run_logs(
        &self,
        organization_id: Uuid,
        run_id: Uuid,
        level: Option<&str>,
    ) -> Result<Vec<RunLogEntry>> {
        let mut metadata = serde_json::json!({ "instance_id": run_id });
        if let Some(level) = level {
            metadata["level"] = serde_json::json!(level);
        }
        let rows = self
            .store
            .query_transactions(
                organization_id,
                &TransactionFilter {
                    transaction_type: Some(EVENT_TRANSACTION_TYPE.to_string()),
                    metadata_contains: Some(metadata),
                    ..Default::default()
                },
                1000,
                0,
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| RunLogEntry {
                level: row
                    .metadata
                    .get("level")
                    .and_then(|v| v.as_str())
                    .unwrap_or("info")
                    .to_string(),
                message: row
                    .metadata
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                step_id: row
                    .metadata
                    .get("step_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                at: row.created_at,
            })
            .collect())
    }

    fn permitted_actions(&self, run: &RunRecord, ctx: &SecurityContext) -> PermittedActions {
        let is_initiator = run.started_by == ctx.user_id;
        let manages = ctx.holds(MANAGE_PERMISSION);
        PermittedActions {
            can_cancel: !run.status.is_terminal()
                && (is_initiator || ctx.holds(CANCEL_PERMISSION) || manages),
            can_retry: matches!(run.status, RunStatus::Failed | RunStatus::Cancelled)
                && ctx.holds(crate::engine::EXECUTE_PERMISSION),
            can_view_logs: is_initiator || manages || ctx.holds(READ_SENSITIVE_PERMISSION),
            can_modify: manages,
        }
    }

    async fn audit_success(
        &self,
        ctx: &SecurityContext,
        action: &str,
        run_id: Uuid,
        context: serde_json::Value,
    ) {
        let _ = self
            .audit
            .record(
                ctx.organization_id,
                ctx.user_id,
                action,
                &format!("run:{}", run_id),
                AuditOutcome::Success,
                context,
            )
            .await;
    }

    async fn audit_denied(
        &self,
        ctx: &SecurityContext,
        action: &str,
        run_id: Uuid,
        permission: &str,
    ) {
        let _ = self
            .audit
            .record(
                ctx.organization_id,
                ctx.user_id,
                action,
                &format!("run:{}", run_id),
                AuditOutcome::Denied,
                serde_json::json!({ "missing": permission }),
            )
            .await;
    }

    async fn audit_failure(
        &self,
        ctx: &SecurityContext,
        action: &str,
        run_id: Uuid,
        error: &EngineError,
    ) {
        let _ = self
            .audit
            .record(
                ctx.organization_id,
                ctx.user_id,
                action,
                &format!("run:{}", run_id),
                AuditOutcome::Failure,
                serde_json::json!({ "error": error.error_code() }),
            )
            .await;
    }
}

fn invalid_status(run: &RunRecord, requested: &str) -> EngineError {
    EngineError::InvalidStatus {
        run_id: run.id.to_string(),
        requested: requested.to_string(),
        current: run.status.as_str().to_string(),
    }
}

fn step_view(
    record: &StepExecutionRecord,
    row: &TransactionRecord,
    include_detail: bool,
) -> StepView {
    StepView {
        id: row.id,
        step_id: record.step_id.clone(),
        step_type: record.step_type.clone(),
        sequence: record.sequence,
        branch: record.branch.clone(),
        iteration: record.iteration,
        status: record.status,
        started_at: record.started_at,
        completed_at: record.completed_at,
        duration_ms: record
            .completed_at
            .map(|end| (end - record.started_at).num_milliseconds()),
        error: record.error.clone(),
        outputs: if include_detail {
            row.metadata.get("outputs").cloned()
        } else {
            None
        },
    }
}

/// Count distinct top-level steps that finished (completed or skipped).
fn count_completed_top_level(rows: &[(StepExecutionRecord, TransactionRecord)]) -> usize {
    let mut seen = std::collections::HashSet::new();
    for (record, _) in rows {
        if record.branch.is_none()
            && record.iteration.is_none()
            && matches!(record.status, StepStatus::Completed | StepStatus::Skipped)
        {
            seen.insert(record.step_id.as_str());
        }
    }
    seen.len()
}

fn project_progress(run: &RunRecord, completed_steps: usize, total_steps: usize) -> RunProgress {
    let percent = if total_steps == 0 {
        0.0
    } else {
        completed_steps as f64 / total_steps as f64 * 100.0
    };

    // ETA: elapsed time divided by progress ratio, minus elapsed.
    // Undefined while progress is zero or once the run is finished.
    let eta_seconds = if completed_steps == 0
        || total_steps == 0
        || run.status.is_terminal()
        || completed_steps >= total_steps
    {
        None
    } else {
        let elapsed = (Utc::now() - run.started_at).num_seconds().max(0);
        let ratio = completed_steps as f64 / total_steps as f64;
        Some(((elapsed as f64 / ratio) - elapsed as f64) as i64)
    };

    RunProgress {
        completed_steps,
        total_steps,
        percent,
        eta_seconds,
    }
}

fn compute_metrics(run: &RunRecord, rows: &[(StepExecutionRecord, TransactionRecord)]) -> RunMetrics {
    let end = run.completed_at.unwrap_or_else(Utc::now);
    let elapsed_seconds = (end - run.started_at).num_seconds().max(0);

    let step_durations: Vec<StepDuration> = rows
        .iter()
        .filter_map(|(record, _)| {
            record.completed_at.map(|done| StepDuration {
                step_id: record.step_id.clone(),
                duration_ms: (done - record.started_at).num_milliseconds().max(0),
            })
        })
        .collect();

    let average_step_ms = if step_durations.is_empty() {
        None
    } else {
        Some(step_durations.iter().map(|d| d.duration_ms).sum::<i64>() / step_durations.len() as i64)
    };

    RunMetrics {
        elapsed_seconds,
        step_durations,
        average_step_ms,
    }
}

fn build_timeline(
    run: &RunRecord,
    rows: &[(StepExecutionRecord, TransactionRecord)],
) -> Vec<TimelineEntry> {
    let mut timeline = vec![TimelineEntry {
        at: run.started_at,
        event: "run started".to_string(),
    }];
    for (record, _) in rows {
        if let Some(done) = record.completed_at {
            timeline.push(TimelineEntry {
                at: done,
                event: format!("step '{}' {}", record.step_id, record.status.as_str()),
            });
        }
    }
    if let Some(done) = run.completed_at {
        timeline.push(TimelineEntry {
            at: done,
            event: format!("run {}", run.status.as_str()),
        });
    }
    timeline.sort_by_key(|e| e.at);
    timeline
}
