// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow execution engine.
//!
//! Interprets a [`WorkflowDefinition`] against a running instance: walks
//! steps in order, evaluates guardrails and conditions, executes actions
//! against the store adapter and status manager, records one execution row
//! per step attempt, and drives the instance to a terminal or suspended
//! state.
//!
//! All instance state is persisted in the store (a `WORKFLOW_INSTANCE`
//! transaction row); there is no in-memory-only suspended state, so a
//! process restart resumes from persisted state alone. Cancellation is
//! cooperative: the loop reloads the instance before every step and stops
//! advancing once the status is no longer `running`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditOutcome, AuditService};
use crate::definition::{
    ActionLine, DEFINITION_ENTITY_TYPE, StepGuardrail, StepKind, StepTimeout, WorkflowAction,
    WorkflowDefinition, WorkflowStep,
};
use crate::error::{EngineError, Result};
use crate::notify::{ExternalApi, LogNotifier, Notifier, NullExternalApi};
use crate::security::SecurityContext;
use crate::status::StatusManager;
use crate::store::{
    NewEntity, NewRelationship, NewTransaction, NewTransactionLine, Store, TransactionFilter,
    TransactionRecord,
};
use crate::template::{resolve_template, resolve_value};

/// Transaction type of workflow instance rows.
pub const INSTANCE_TRANSACTION_TYPE: &str = "WORKFLOW_INSTANCE";
/// Transaction type of step execution rows.
pub const STEP_TRANSACTION_TYPE: &str = "WORKFLOW_STEP_EXECUTION";
/// Transaction type of engine event rows (the run log).
pub const EVENT_TRANSACTION_TYPE: &str = "WORKFLOW_EVENT";
/// Entity type of tasks created by `user_action` steps.
pub const TASK_ENTITY_TYPE: &str = "task";

const INSTANCE_SMART_CODE: &str = "PLAYBOOK.WORKFLOW.INSTANCE.V1";
const STEP_SMART_CODE: &str = "PLAYBOOK.WORKFLOW.STEP.EXEC.V1";
const EVENT_SMART_CODE: &str = "PLAYBOOK.WORKFLOW.EVENT.V1";
const TASK_SMART_CODE: &str = "PLAYBOOK.WORKFLOW.TASK.V1";

/// Permission required to start runs and complete suspended steps.
pub const EXECUTE_PERMISSION: &str = "playbook_run:execute";
/// Permission required to publish definitions.
pub const PUBLISH_PERMISSION: &str = "playbook_definition:publish";

/// Workflow instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Actively executing or suspended at a step awaiting an external event.
    Running,
    /// Externally paused; resumable.
    Paused,
    /// Finished successfully (terminal).
    Completed,
    /// Finished with an error (terminal).
    Failed,
    /// Externally cancelled (terminal).
    Cancelled,
}

impl RunStatus {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is defined out of this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Suspended, awaiting an external completion or wake.
    Pending,
    /// Currently executing (transient; never persisted mid-step).
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Condition was false; actions did not run.
    Skipped,
}

impl StepStatus {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One workflow instance, backed by a `WORKFLOW_INSTANCE` transaction row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Instance id (the backing transaction id).
    #[serde(skip)]
    pub id: Uuid,
    /// Owning organization.
    #[serde(skip)]
    pub organization_id: Uuid,
    /// The definition entity this run executes.
    pub definition_id: Uuid,
    /// Instance status.
    pub status: RunStatus,
    /// Step the instance is at; `None` once all steps are done.
    #[serde(default)]
    pub current_step_id: Option<String>,
    /// Instance variables, mutated only by actions.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// The user who started the run.
    pub started_by: Uuid,
    /// Scheduling priority label.
    #[serde(default = "default_priority")]
    pub priority: String,
    /// Error recorded when the run failed.
    #[serde(default)]
    pub error: Option<String>,
}

fn default_priority() -> String {
    "normal".to_string()
}

impl RunRecord {
    /// Rehydrate a run from its backing transaction row.
    pub fn from_transaction(txn: &TransactionRecord) -> Result<Self> {
        let mut run: RunRecord =
            serde_json::from_value(txn.metadata.clone()).map_err(|e| EngineError::Store {
                operation: "decode_run".to_string(),
                details: e.to_string(),
            })?;
        run.id = txn.id;
        run.organization_id = txn.organization_id;
        Ok(run)
    }

    /// Serialize the run into transaction metadata.
    pub fn to_metadata(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// One step execution row, backed by a `WORKFLOW_STEP_EXECUTION`
/// transaction. Rows are append-only across attempts; a suspended step's
/// pending row is finalized in place when its external completion arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// Row id (the backing transaction id).
    #[serde(skip)]
    pub id: Uuid,
    /// Instance the row belongs to.
    pub instance_id: Uuid,
    /// Step id within the definition.
    pub step_id: String,
    /// Step kind tag.
    pub step_type: String,
    /// Top-level step sequence (0-based), for strict ordering.
    pub sequence: usize,
    /// Branch step id for parallel fan-out rows.
    #[serde(default)]
    pub branch: Option<String>,
    /// Iteration index for loop rows.
    #[serde(default)]
    pub iteration: Option<usize>,
    /// Execution status.
    pub status: StepStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error recorded when the attempt failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl StepExecutionRecord {
    /// Rehydrate a step execution from its backing transaction row.
    pub fn from_transaction(txn: &TransactionRecord) -> Result<Self> {
        let mut record: StepExecutionRecord =
            serde_json::from_value(txn.metadata.clone()).map_err(|e| EngineError::Store {
                operation: "decode_step_execution".to_string(),
                details: e.to_string(),
            })?;
        record.id = txn.id;
        Ok(record)
    }
}

/// Where the instance goes after a step.
enum StepOutcome {
    /// Step finished; move to the next step in sequence.
    Advance,
    /// Error handler routed execution to another step.
    Jump(String),
    /// Step suspended the instance until an external event.
    Suspended,
    /// Step failed with no handler; the instance must fail.
    Failed(String),
}

/// The workflow execution engine.
pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    status: StatusManager,
    audit: AuditService,
    notifier: Arc<dyn Notifier>,
    external_api: Arc<dyn ExternalApi>,
}

impl WorkflowEngine {
    /// Create an engine with log-only notification and external-API seams.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            status: StatusManager::new(store.clone()),
            audit: AuditService::new(store.clone()),
            notifier: Arc::new(LogNotifier),
            external_api: Arc::new(NullExternalApi),
            store,
        }
    }

    /// Replace the notifier seam.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the external-API seam.
    pub fn with_external_api(mut self, external_api: Arc<dyn ExternalApi>) -> Self {
        self.external_api = external_api;
        self
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Access the status manager.
    pub fn status_manager(&self) -> &StatusManager {
        &self.status
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Publish a definition after validating it.
    ///
    /// The definition is stored as a `workflow_definition` entity whose
    /// code is `<name>:v<version>`; publishing the same version twice is a
    /// conflict.
    #[instrument(skip(self, definition, ctx), fields(name = %definition.name, version = definition.version))]
    pub async fn publish_definition(
        &self,
        organization_id: Uuid,
        definition: &WorkflowDefinition,
        ctx: &SecurityContext,
    ) -> Result<Uuid> {
        if !ctx.holds(PUBLISH_PERMISSION) {
            return Err(EngineError::Forbidden {
                permission: PUBLISH_PERMISSION.to_string(),
            });
        }

        let issues = definition.validate();
        if let Some(first) = issues.first() {
            return Err(EngineError::Validation {
                field: "definition".to_string(),
                message: format!("{} issue(s), first: {}", issues.len(), first.message),
            });
        }

        let entity = self
            .store
            .create_entity(&NewEntity {
                organization_id,
                entity_type: DEFINITION_ENTITY_TYPE.to_string(),
                name: definition.name.clone(),
                code: Some(format!("{}:v{}", definition.name, definition.version)),
                smart_code: "PLAYBOOK.WORKFLOW.DEFINITION.V1".to_string(),
                metadata: serde_json::to_value(definition)?,
            })
            .await?;

        info!(definition_id = %entity.id, "Definition published");
        Ok(entity.id)
    }

    /// Load and parse a definition entity.
    pub async fn load_definition(
        &self,
        organization_id: Uuid,
        definition_id: Uuid,
    ) -> Result<WorkflowDefinition> {
        let entity = self
            .store
            .get_entity(organization_id, definition_id)
            .await?
            .filter(|e| e.entity_type == DEFINITION_ENTITY_TYPE)
            .ok_or_else(|| EngineError::NotFound {
                kind: "definition",
                id: definition_id.to_string(),
            })?;
        WorkflowDefinition::parse(&entity.metadata)
    }

    // ========================================================================
    // Run lifecycle
    // ========================================================================

    /// Start a new run of a definition and drive it until it finishes or
    /// suspends.
    ///
    /// Variables are seeded from definition defaults, then trigger-supplied
    /// values; missing required variables fail validation before anything
    /// is persisted.
    #[instrument(skip(self, trigger_variables, ctx), fields(definition_id = %definition_id, user_id = %ctx.user_id))]
    pub async fn start(
        &self,
        organization_id: Uuid,
        definition_id: Uuid,
        trigger_variables: Map<String, Value>,
        ctx: &SecurityContext,
    ) -> Result<RunRecord> {
        if !ctx.holds(EXECUTE_PERMISSION) {
            self.audit_denied(ctx, "run.start", &definition_id.to_string())
                .await;
            return Err(EngineError::Forbidden {
                permission: EXECUTE_PERMISSION.to_string(),
            });
        }

        let definition = self.load_definition(organization_id, definition_id).await?;
        let variables = seed_variables(&definition, trigger_variables)?;

        let first_step = definition.steps.first().map(|s| s.id.clone());
        let now = Utc::now();
        let run = RunRecord {
            id: Uuid::nil(),
            organization_id,
            definition_id,
            status: RunStatus::Running,
            current_step_id: first_step,
            variables,
            started_at: now,
            completed_at: None,
            started_by: ctx.user_id,
            priority: default_priority(),
            error: None,
        };

        let txn = self
            .store
            .create_transaction(
                &NewTransaction {
                    organization_id,
                    transaction_type: INSTANCE_TRANSACTION_TYPE.to_string(),
                    smart_code: INSTANCE_SMART_CODE.to_string(),
                    source_entity_id: Some(definition_id),
                    target_entity_id: None,
                    total_amount: 0.0,
                    transaction_date: now,
                    metadata: run.to_metadata()?,
                },
                &[],
            )
            .await?;

        info!(run_id = %txn.id, "Run started");
        self.record_event(organization_id, txn.id, "info", "run started", None)
            .await;
        if let Err(e) = self
            .audit
            .record(
                organization_id,
                ctx.user_id,
                "run.start",
                &format!("run:{}", txn.id),
                AuditOutcome::Success,
                serde_json::json!({ "definition_id": definition_id }),
            )
            .await
        {
            warn!(error = %e, "Failed to audit run start");
        }

        self.advance(organization_id, txn.id).await
    }

    /// Load a run by id.
    pub async fn load_run(&self, organization_id: Uuid, run_id: Uuid) -> Result<RunRecord> {
        let txn = self
            .store
            .get_transaction(organization_id, run_id)
            .await?
            .filter(|t| t.transaction_type == INSTANCE_TRANSACTION_TYPE)
            .ok_or_else(|| EngineError::NotFound {
                kind: "run",
                id: run_id.to_string(),
            })?;
        RunRecord::from_transaction(&txn)
    }

    /// Drive a run forward until it reaches a terminal status or suspends.
    ///
    /// Safe to call on a run in any state: non-running runs are returned
    /// unchanged. The instance is reloaded before every step, so an
    /// externally applied pause or cancel stops the loop at the next step
    /// boundary.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn advance(&self, organization_id: Uuid, run_id: Uuid) -> Result<RunRecord> {
        loop {
            let mut run = self.load_run(organization_id, run_id).await?;
            if run.status != RunStatus::Running {
                debug!(status = %run.status.as_str(), "Run is not running; stopping");
                return Ok(run);
            }

            let definition = self.load_definition(organization_id, run.definition_id).await?;
            let Some(current_id) = run.current_step_id.clone() else {
                return self.complete_run(run).await;
            };
            let Some(index) = definition.step_index(&current_id) else {
                return self
                    .fail_run(run, format!("unknown step '{}'", current_id))
                    .await;
            };
            let step = &definition.steps[index];

            match self.execute_step(&mut run, step, index).await? {
                StepOutcome::Advance => match definition.steps.get(index + 1) {
                    Some(next) => {
                        run.current_step_id = Some(next.id.clone());
                        self.save_run(&run).await?;
                    }
                    None => {
                        run.current_step_id = None;
                        return self.complete_run(run).await;
                    }
                },
                StepOutcome::Jump(target) => {
                    if definition.step_index(&target).is_none() {
                        return self
                            .fail_run(run, format!("error handler routes to unknown step '{}'", target))
                            .await;
                    }
                    debug!(target = %target, "Error handler routed execution");
                    run.current_step_id = Some(target);
                    self.save_run(&run).await?;
                }
                StepOutcome::Suspended => {
                    self.save_run(&run).await?;
                    return self.load_run(organization_id, run_id).await;
                }
                StepOutcome::Failed(error) => {
                    return self.fail_run(run, error).await;
                }
            }
        }
    }

    /// Complete a suspended `user_action` or `wait` step with outputs.
    ///
    /// The outputs are merged into instance variables, the step's pending
    /// row is finalized, and the run advances.
    #[instrument(skip(self, outputs, ctx), fields(run_id = %run_id, step_id = %step_id))]
    pub async fn complete_step(
        &self,
        organization_id: Uuid,
        run_id: Uuid,
        step_id: &str,
        outputs: Map<String, Value>,
        ctx: &SecurityContext,
    ) -> Result<RunRecord> {
        if !ctx.holds(EXECUTE_PERMISSION) {
            self.audit_denied(ctx, "run.complete_step", &run_id.to_string())
                .await;
            return Err(EngineError::Forbidden {
                permission: EXECUTE_PERMISSION.to_string(),
            });
        }

        let mut run = self.load_run(organization_id, run_id).await?;
        if run.status != RunStatus::Running {
            return Err(EngineError::InvalidStatus {
                run_id: run_id.to_string(),
                requested: "complete step of".to_string(),
                current: run.status.as_str().to_string(),
            });
        }
        if run.current_step_id.as_deref() != Some(step_id) {
            return Err(EngineError::Validation {
                field: "step_id".to_string(),
                message: format!(
                    "run is at step '{}', not '{}'",
                    run.current_step_id.as_deref().unwrap_or("<none>"),
                    step_id
                ),
            });
        }

        let Some(pending) = self.find_pending_row(organization_id, run_id, step_id).await? else {
            return Err(EngineError::Validation {
                field: "step_id".to_string(),
                message: format!("step '{}' is not suspended", step_id),
            });
        };

        self.finalize_step_row(
            organization_id,
            &pending,
            StepStatus::Completed,
            None,
            Some(serde_json::Value::Object(outputs.clone())),
        )
        .await?;

        for (name, value) in outputs {
            run.variables.insert(name, value);
        }

        let definition = self.load_definition(organization_id, run.definition_id).await?;
        let index = definition.step_index(step_id).ok_or_else(|| EngineError::NotFound {
            kind: "step",
            id: step_id.to_string(),
        })?;
        self.record_event(
            organization_id,
            run_id,
            "info",
            &format!("step '{}' completed externally", step_id),
            Some(step_id),
        )
        .await;

        match definition.steps.get(index + 1) {
            Some(next) => {
                run.current_step_id = Some(next.id.clone());
                self.save_run(&run).await?;
                self.advance(organization_id, run_id).await
            }
            None => {
                run.current_step_id = None;
                self.complete_run(run).await
            }
        }
    }

    /// External time-trigger entry for an expired step timeout.
    ///
    /// Applies only while the run is suspended at the named step; a stale
    /// timeout (the run has moved on or finished) is a no-op. With a
    /// declared fallback step the run jumps there, otherwise it fails.
    #[instrument(skip(self), fields(run_id = %run_id, step_id = %step_id))]
    pub async fn handle_timeout(
        &self,
        organization_id: Uuid,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<RunRecord> {
        let mut run = self.load_run(organization_id, run_id).await?;
        if run.status != RunStatus::Running || run.current_step_id.as_deref() != Some(step_id) {
            debug!("Stale timeout ignored");
            return Ok(run);
        }

        let Some(pending) = self.find_pending_row(organization_id, run_id, step_id).await? else {
            debug!("No pending row for timed-out step; ignoring");
            return Ok(run);
        };

        let definition = self.load_definition(organization_id, run.definition_id).await?;
        let timeout = definition
            .find_step(step_id)
            .and_then(|s| s.timeout.clone());

        let message = match &timeout {
            Some(StepTimeout {
                duration_seconds, ..
            }) => format!("step '{}' timed out after {}s", step_id, duration_seconds),
            None => format!("step '{}' timed out", step_id),
        };

        self.finalize_step_row(
            organization_id,
            &pending,
            StepStatus::Failed,
            Some(message.clone()),
            None,
        )
        .await?;
        self.record_event(organization_id, run_id, "error", &message, Some(step_id))
            .await;

        match timeout.and_then(|t| t.fallback_step_id) {
            Some(fallback) if definition.step_index(&fallback).is_some() => {
                run.current_step_id = Some(fallback);
                self.save_run(&run).await?;
                self.advance(organization_id, run_id).await
            }
            _ => self.fail_run(run, message).await,
        }
    }

    // ========================================================================
    // Step execution
    // ========================================================================

    async fn execute_step(
        &self,
        run: &mut RunRecord,
        step: &WorkflowStep,
        sequence: usize,
    ) -> Result<StepOutcome> {
        debug!(step_id = %step.id, step_type = %step.kind.tag(), "Executing step");
        let step_started = Utc::now();

        // Guardrails fail closed: no actions run, the instance fails
        for guardrail in &step.guardrails {
            if let Err(e) = self.check_guardrail(run, step, guardrail).await {
                let message = e.to_string();
                self.write_step_row(
                    run,
                    step,
                    sequence,
                    step_started,
                    StepStatus::Failed,
                    Some(message.clone()),
                )
                .await?;
                self.record_event(
                    run.organization_id,
                    run.id,
                    "error",
                    &message,
                    Some(&step.id),
                )
                .await;
                return Ok(StepOutcome::Failed(message));
            }
        }

        match &step.kind {
            StepKind::Action => match self.run_actions(run, step, &step.actions).await {
                Ok(()) => {
                    self.write_step_row(run, step, sequence, step_started, StepStatus::Completed, None)
                        .await?;
                    Ok(StepOutcome::Advance)
                }
                Err(e) => self.route_step_error(run, step, sequence, step_started, e).await,
            },
            StepKind::Conditional { condition } => {
                if condition.evaluate(&run.variables) {
                    match self.run_actions(run, step, &step.actions).await {
                        Ok(()) => {
                            self.write_step_row(
                                run,
                                step,
                                sequence,
                                step_started,
                                StepStatus::Completed,
                                None,
                            )
                            .await?;
                            Ok(StepOutcome::Advance)
                        }
                        Err(e) => self.route_step_error(run, step, sequence, step_started, e).await,
                    }
                } else {
                    // A false condition is a no-op, still recorded as completed
                    debug!(step_id = %step.id, "Condition false; skipping actions");
                    self.write_step_row(run, step, sequence, step_started, StepStatus::Skipped, None)
                        .await?;
                    Ok(StepOutcome::Advance)
                }
            }
            StepKind::UserAction {
                assignee,
                due_in_hours,
            } => {
                if self
                    .find_pending_row(run.organization_id, run.id, &step.id)
                    .await?
                    .is_some()
                {
                    // Already suspended here; nothing to do until completion
                    return Ok(StepOutcome::Suspended);
                }
                self.create_task(run, step, assignee.as_deref(), *due_in_hours)
                    .await?;
                self.write_step_row(run, step, sequence, step_started, StepStatus::Pending, None)
                    .await?;
                self.record_event(
                    run.organization_id,
                    run.id,
                    "info",
                    &format!("awaiting user action for step '{}'", step.id),
                    Some(&step.id),
                )
                .await;
                Ok(StepOutcome::Suspended)
            }
            StepKind::Wait {
                resume_after_seconds,
                event,
            } => {
                if self
                    .find_pending_row(run.organization_id, run.id, &step.id)
                    .await?
                    .is_some()
                {
                    return Ok(StepOutcome::Suspended);
                }
                // Record intent only; an external scheduler re-enters the
                // engine when the wait elapses or the event arrives.
                let resume_at = resume_after_seconds
                    .map(|secs| (Utc::now() + Duration::seconds(secs)).to_rfc3339());
                self.write_step_row_with(
                    run,
                    step,
                    sequence,
                    step_started,
                    StepStatus::Pending,
                    None,
                    |meta| {
                        if let Some(ref at) = resume_at {
                            meta.insert("resume_at".to_string(), serde_json::json!(at));
                        }
                        if let Some(event) = event {
                            meta.insert("resume_event".to_string(), serde_json::json!(event));
                        }
                    },
                )
                .await?;
                self.record_event(
                    run.organization_id,
                    run.id,
                    "info",
                    &format!("waiting at step '{}'", step.id),
                    Some(&step.id),
                )
                .await;
                Ok(StepOutcome::Suspended)
            }
            StepKind::Parallel { branches } => {
                // Fan out: every branch records its own row; all branches
                // must finish before the instance advances (fan-in).
                for branch in branches {
                    let branch_started = Utc::now();
                    for guardrail in &branch.guardrails {
                        if let Err(e) = self.check_guardrail(run, branch, guardrail).await {
                            let message = e.to_string();
                            self.write_branch_row(
                                run,
                                step,
                                branch,
                                sequence,
                                branch_started,
                                StepStatus::Failed,
                                Some(message.clone()),
                            )
                            .await?;
                            return Ok(StepOutcome::Failed(message));
                        }
                    }
                    match self.run_actions(run, branch, &branch.actions).await {
                        Ok(()) => {
                            self.write_branch_row(
                                run,
                                step,
                                branch,
                                sequence,
                                branch_started,
                                StepStatus::Completed,
                                None,
                            )
                            .await?;
                        }
                        Err(e) => {
                            self.write_branch_row(
                                run,
                                step,
                                branch,
                                sequence,
                                branch_started,
                                StepStatus::Failed,
                                Some(e.to_string()),
                            )
                            .await?;
                            return self.route_error_without_row(run, step, e).await;
                        }
                    }
                }
                self.write_step_row(run, step, sequence, step_started, StepStatus::Completed, None)
                    .await?;
                Ok(StepOutcome::Advance)
            }
            StepKind::Loop { items, item_var } => {
                let elements = match run.variables.get(items).and_then(|v| v.as_array()).cloned() {
                    Some(elements) => elements,
                    None => {
                        let e = EngineError::ActionFailed {
                            step_id: step.id.clone(),
                            action: "loop".to_string(),
                            details: format!("variable '{}' is not an array", items),
                        };
                        return self.route_step_error(run, step, sequence, step_started, e).await;
                    }
                };
                for (iteration, element) in elements.iter().enumerate() {
                    let iteration_started = Utc::now();
                    run.variables.insert(item_var.clone(), element.clone());
                    match self.run_actions(run, step, &step.actions).await {
                        Ok(()) => {
                            self.write_iteration_row(
                                run,
                                step,
                                sequence,
                                iteration_started,
                                iteration,
                                StepStatus::Completed,
                                None,
                            )
                            .await?;
                        }
                        Err(e) => {
                            self.write_iteration_row(
                                run,
                                step,
                                sequence,
                                iteration_started,
                                iteration,
                                StepStatus::Failed,
                                Some(e.to_string()),
                            )
                            .await?;
                            return self.route_error_without_row(run, step, e).await;
                        }
                    }
                }
                run.variables.remove(item_var);
                self.write_step_row(run, step, sequence, step_started, StepStatus::Completed, None)
                    .await?;
                Ok(StepOutcome::Advance)
            }
        }
    }

    /// Record the failed row for a step, then route to its error handler or
    /// fail the instance.
    async fn route_step_error(
        &self,
        run: &mut RunRecord,
        step: &WorkflowStep,
        sequence: usize,
        started_at: DateTime<Utc>,
        error: EngineError,
    ) -> Result<StepOutcome> {
        self.write_step_row(run, step, sequence, started_at, StepStatus::Failed, Some(error.to_string()))
            .await?;
        self.route_error_without_row(run, step, error).await
    }

    /// Route an already-recorded failure to the step's error handler.
    async fn route_error_without_row(
        &self,
        run: &RunRecord,
        step: &WorkflowStep,
        error: EngineError,
    ) -> Result<StepOutcome> {
        self.record_event(
            run.organization_id,
            run.id,
            "error",
            &error.to_string(),
            Some(&step.id),
        )
        .await;

        let handler = step
            .error_handlers
            .get(error.error_code())
            .or_else(|| step.error_handlers.get("default"));
        match handler {
            Some(target) => Ok(StepOutcome::Jump(target.clone())),
            None => Ok(StepOutcome::Failed(error.to_string())),
        }
    }

    // ========================================================================
    // Guardrails
    // ========================================================================

    async fn check_guardrail(
        &self,
        run: &RunRecord,
        step: &WorkflowStep,
        guardrail: &StepGuardrail,
    ) -> Result<()> {
        match guardrail {
            StepGuardrail::PaymentRequired {
                subject,
                link_suffix,
            } => {
                let subject_id =
                    parse_entity_ref(&step.id, guardrail.kind(), subject, &run.variables)?;
                let links = self
                    .store
                    .query_relationships(
                        run.organization_id,
                        &crate::store::RelationshipFilter {
                            from_entity_id: Some(subject_id),
                            relationship_type_suffix: Some(link_suffix.clone()),
                            active_only: true,
                            ..Default::default()
                        },
                    )
                    .await?;

                for link in &links {
                    if let Some(payment) = self
                        .store
                        .get_transaction(run.organization_id, link.to_entity_id)
                        .await?
                    {
                        let payment_status = payment
                            .metadata
                            .get("status")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if matches!(payment_status, "settled" | "approved") {
                            return Ok(());
                        }
                    }
                }
                Err(EngineError::GuardrailViolation {
                    step_id: step.id.clone(),
                    guardrail: guardrail.kind().to_string(),
                    message: "Payment required: no settled or approved payment is linked"
                        .to_string(),
                })
            }
            StepGuardrail::StatusIs {
                subject,
                status_smart_code,
            } => {
                let subject_id =
                    parse_entity_ref(&step.id, guardrail.kind(), subject, &run.variables)?;
                let current = self
                    .status
                    .current_status(run.organization_id, subject_id)
                    .await?;
                match current {
                    Some(status) if status.smart_code == *status_smart_code => Ok(()),
                    other => Err(EngineError::GuardrailViolation {
                        step_id: step.id.clone(),
                        guardrail: guardrail.kind().to_string(),
                        message: format!(
                            "expected status '{}', found '{}'",
                            status_smart_code,
                            other.map(|s| s.smart_code).unwrap_or_else(|| "<none>".to_string())
                        ),
                    }),
                }
            }
            StepGuardrail::VariablePresent { name } => {
                match run.variables.get(name) {
                    Some(v) if !v.is_null() => Ok(()),
                    _ => Err(EngineError::GuardrailViolation {
                        step_id: step.id.clone(),
                        guardrail: guardrail.kind().to_string(),
                        message: format!("required variable '{}' is absent", name),
                    }),
                }
            }
        }
    }

    // ========================================================================
    // Actions
    // ========================================================================

    async fn run_actions(
        &self,
        run: &mut RunRecord,
        step: &WorkflowStep,
        actions: &[WorkflowAction],
    ) -> Result<()> {
        for action in actions {
            self.run_action(run, step, action).await?;
        }
        Ok(())
    }

    async fn run_action(
        &self,
        run: &mut RunRecord,
        step: &WorkflowStep,
        action: &WorkflowAction,
    ) -> Result<()> {
        let org = run.organization_id;
        match action {
            WorkflowAction::CreateEntity {
                entity_type,
                name,
                code,
                smart_code,
                metadata,
                output_var,
            } => {
                let entity = self
                    .store
                    .create_entity(&NewEntity {
                        organization_id: org,
                        entity_type: entity_type.clone(),
                        name: resolve_template(name, &run.variables),
                        code: code
                            .as_deref()
                            .map(|c| resolve_template(c, &run.variables)),
                        smart_code: smart_code.clone(),
                        metadata: metadata
                            .as_ref()
                            .map(|m| resolve_value(m, &run.variables))
                            .unwrap_or_else(|| serde_json::json!({})),
                    })
                    .await
                    .map_err(|e| action_failed(step, action, e))?;
                if let Some(var) = output_var {
                    run.variables
                        .insert(var.clone(), serde_json::json!(entity.id));
                }
            }
            WorkflowAction::CreateRelationship {
                from,
                to,
                relationship_type,
                smart_code,
            } => {
                let from_id = parse_entity_ref(&step.id, action.tag(), from, &run.variables)?;
                let to_id = parse_entity_ref(&step.id, action.tag(), to, &run.variables)?;
                self.store
                    .create_relationship(&NewRelationship {
                        organization_id: org,
                        from_entity_id: from_id,
                        to_entity_id: to_id,
                        relationship_type: relationship_type.clone(),
                        smart_code: smart_code.clone(),
                        is_active: true,
                        effective_date: Utc::now(),
                    })
                    .await
                    .map_err(|e| action_failed(step, action, e))?;
            }
            WorkflowAction::SetStatus {
                subject,
                status_smart_code,
            } => {
                let subject_id = parse_entity_ref(&step.id, action.tag(), subject, &run.variables)?;
                self.status
                    .set_status(org, subject_id, status_smart_code)
                    .await
                    .map_err(|e| action_failed(step, action, e))?;
            }
            WorkflowAction::CreateTransaction {
                transaction_type,
                smart_code,
                source,
                target,
                total_amount,
                lines,
                output_var,
            } => {
                let source_id = match source {
                    Some(s) => Some(parse_entity_ref(&step.id, action.tag(), s, &run.variables)?),
                    None => None,
                };
                let target_id = match target {
                    Some(t) => Some(parse_entity_ref(&step.id, action.tag(), t, &run.variables)?),
                    None => None,
                };
                let amount = resolve_amount(&step.id, action.tag(), total_amount, &run.variables)?;
                let line_rows = self.build_lines(&step.id, action, lines, run)?;
                let txn = self
                    .store
                    .create_transaction(
                        &NewTransaction {
                            organization_id: org,
                            transaction_type: transaction_type.clone(),
                            smart_code: smart_code.clone(),
                            source_entity_id: source_id,
                            target_entity_id: target_id,
                            total_amount: amount,
                            transaction_date: Utc::now(),
                            metadata: serde_json::json!({ "instance_id": run.id }),
                        },
                        &line_rows,
                    )
                    .await
                    .map_err(|e| action_failed(step, action, e))?;
                if let Some(var) = output_var {
                    run.variables.insert(var.clone(), serde_json::json!(txn.id));
                }
            }
            WorkflowAction::SendNotification {
                channel,
                recipient,
                message,
            } => {
                let recipient = resolve_template(recipient, &run.variables);
                let message = resolve_template(message, &run.variables);
                // Fire-and-forget: a delivery failure is recorded, never
                // retried, and does not fail the step
                if let Err(e) = self.notifier.send(org, channel, &recipient, &message).await {
                    warn!(channel = %channel, error = %e, "Notification delivery failed");
                    self.record_event(
                        org,
                        run.id,
                        "warn",
                        &format!("notification via '{}' failed: {}", channel, e),
                        Some(&step.id),
                    )
                    .await;
                }
            }
            WorkflowAction::CallExternalApi {
                method,
                url,
                payload,
                output_var,
            } => {
                let url = resolve_template(url, &run.variables);
                let payload = payload.as_ref().map(|p| resolve_value(p, &run.variables));
                let response = self
                    .external_api
                    .call(method, &url, payload.as_ref())
                    .await
                    .map_err(|e| action_failed(step, action, e))?;
                if let Some(var) = output_var {
                    run.variables.insert(var.clone(), response);
                }
            }
            WorkflowAction::SetVariable { name, value } => {
                let resolved = resolve_value(value, &run.variables);
                run.variables.insert(name.clone(), resolved);
            }
        }
        Ok(())
    }

    fn build_lines(
        &self,
        step_id: &str,
        action: &WorkflowAction,
        lines: &[ActionLine],
        run: &RunRecord,
    ) -> Result<Vec<NewTransactionLine>> {
        let mut rows = Vec::with_capacity(lines.len());
        for line in lines {
            let line_entity_id = match &line.entity {
                Some(entity) => Some(parse_entity_ref(step_id, action.tag(), entity, &run.variables)?),
                None => None,
            };
            rows.push(NewTransactionLine {
                line_number: line.line_number,
                line_entity_id,
                description: line
                    .description
                    .as_deref()
                    .map(|d| resolve_template(d, &run.variables)),
                amount: line.amount,
                metadata: serde_json::json!({}),
            });
        }
        Ok(rows)
    }

    async fn create_task(
        &self,
        run: &RunRecord,
        step: &WorkflowStep,
        assignee: Option<&str>,
        due_in_hours: Option<i64>,
    ) -> Result<()> {
        let due_hours = due_in_hours.or_else(|| {
            step.timeout
                .as_ref()
                .map(|t| (t.duration_seconds + 3599) / 3600)
        });
        let due_at = due_hours.map(|h| (Utc::now() + Duration::hours(h)).to_rfc3339());
        let assignee = assignee.map(|a| resolve_template(a, &run.variables));

        self.store
            .create_entity(&NewEntity {
                organization_id: run.organization_id,
                entity_type: TASK_ENTITY_TYPE.to_string(),
                name: step.name.clone(),
                code: None,
                smart_code: TASK_SMART_CODE.to_string(),
                metadata: serde_json::json!({
                    "instance_id": run.id,
                    "step_id": step.id,
                    "assignee": assignee,
                    "due_at": due_at,
                }),
            })
            .await?;
        Ok(())
    }

    // ========================================================================
    // Persistence helpers
    // ========================================================================

    /// Persist the run, preserving an externally applied pause/cancel.
    ///
    /// The loop only ever writes `running` for a live run; if another
    /// caller has paused or cancelled it in the meantime, that status wins
    /// and the loop observes it on the next reload.
    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let mut to_save = run.clone();
        if !to_save.status.is_terminal() {
            let fresh = self.load_run(run.organization_id, run.id).await?;
            if fresh.status != RunStatus::Running {
                to_save.status = fresh.status;
            }
        }
        self.store
            .update_transaction(run.organization_id, run.id, &to_save.to_metadata()?)
            .await
    }

    async fn complete_run(&self, mut run: RunRecord) -> Result<RunRecord> {
        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        run.current_step_id = None;
        self.save_run(&run).await?;
        info!(run_id = %run.id, "Run completed");
        self.record_event(run.organization_id, run.id, "info", "run completed", None)
            .await;
        Ok(run)
    }

    async fn fail_run(&self, mut run: RunRecord, error: String) -> Result<RunRecord> {
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now());
        run.error = Some(error.clone());
        self.save_run(&run).await?;
        warn!(run_id = %run.id, error = %error, "Run failed");
        self.record_event(
            run.organization_id,
            run.id,
            "error",
            &format!("run failed: {}", error),
            None,
        )
        .await;
        Ok(run)
    }

    async fn write_step_row(
        &self,
        run: &RunRecord,
        step: &WorkflowStep,
        sequence: usize,
        started_at: DateTime<Utc>,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.write_step_row_with(run, step, sequence, started_at, status, error, |_| {})
            .await
    }

    async fn write_branch_row(
        &self,
        run: &RunRecord,
        step: &WorkflowStep,
        branch: &WorkflowStep,
        sequence: usize,
        started_at: DateTime<Utc>,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<()> {
        let branch_id = branch.id.clone();
        self.write_step_row_with(run, branch, sequence, started_at, status, error, move |meta| {
            meta.insert("branch".to_string(), serde_json::json!(branch_id));
            meta.insert("parent_step_id".to_string(), serde_json::json!(step.id));
        })
        .await
    }

    async fn write_iteration_row(
        &self,
        run: &RunRecord,
        step: &WorkflowStep,
        sequence: usize,
        started_at: DateTime<Utc>,
        iteration: usize,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.write_step_row_with(run, step, sequence, started_at, status, error, move |meta| {
            meta.insert("iteration".to_string(), serde_json::json!(iteration));
        })
        .await
    }

    /// Write one step-execution row. Rows for action steps are written only
    /// after the step's actions all completed or all failed, so readers
    /// never observe a partial step.
    #[allow(clippy::too_many_arguments)]
    async fn write_step_row_with<F>(
        &self,
        run: &RunRecord,
        step: &WorkflowStep,
        sequence: usize,
        started_at: DateTime<Utc>,
        status: StepStatus,
        error: Option<String>,
        extend: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let now = Utc::now();
        let record = StepExecutionRecord {
            id: Uuid::nil(),
            instance_id: run.id,
            step_id: step.id.clone(),
            step_type: step.kind.tag().to_string(),
            sequence,
            branch: None,
            iteration: None,
            status,
            started_at,
            completed_at: match status {
                StepStatus::Pending | StepStatus::Running => None,
                _ => Some(now),
            },
            error,
        };
        let mut metadata = match serde_json::to_value(&record)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        extend(&mut metadata);

        self.store
            .create_transaction(
                &NewTransaction {
                    organization_id: run.organization_id,
                    transaction_type: STEP_TRANSACTION_TYPE.to_string(),
                    smart_code: STEP_SMART_CODE.to_string(),
                    source_entity_id: None,
                    target_entity_id: None,
                    total_amount: 0.0,
                    transaction_date: now,
                    metadata: Value::Object(metadata),
                },
                &[],
            )
            .await?;
        Ok(())
    }

    async fn find_pending_row(
        &self,
        organization_id: Uuid,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<Option<TransactionRecord>> {
        let mut rows = self
            .store
            .query_transactions(
                organization_id,
                &TransactionFilter {
                    transaction_type: Some(STEP_TRANSACTION_TYPE.to_string()),
                    metadata_contains: Some(serde_json::json!({
                        "instance_id": run_id,
                        "step_id": step_id,
                        "status": "pending",
                    })),
                    ..Default::default()
                },
                10,
                0,
            )
            .await?;
        Ok(rows.pop())
    }

    async fn finalize_step_row(
        &self,
        organization_id: Uuid,
        row: &TransactionRecord,
        status: StepStatus,
        error: Option<String>,
        outputs: Option<Value>,
    ) -> Result<()> {
        let mut metadata = row.metadata.clone();
        metadata["status"] = serde_json::json!(status.as_str());
        metadata["completed_at"] = serde_json::json!(Utc::now().to_rfc3339());
        if let Some(error) = error {
            metadata["error"] = serde_json::json!(error);
        }
        if let Some(outputs) = outputs {
            metadata["outputs"] = outputs;
        }
        self.store
            .update_transaction(organization_id, row.id, &metadata)
            .await
    }

    /// Append one run-log event. Event-log failures are logged and never
    /// fail the caller.
    async fn record_event(
        &self,
        organization_id: Uuid,
        run_id: Uuid,
        level: &str,
        message: &str,
        step_id: Option<&str>,
    ) {
        let result = self
            .store
            .create_transaction(
                &NewTransaction {
                    organization_id,
                    transaction_type: EVENT_TRANSACTION_TYPE.to_string(),
                    smart_code: EVENT_SMART_CODE.to_string(),
                    source_entity_id: None,
                    target_entity_id: None,
                    total_amount: 0.0,
                    transaction_date: Utc::now(),
                    metadata: serde_json::json!({
                        "instance_id": run_id,
                        "level": level,
                        "message": message,
                        "step_id": step_id,
                    }),
                },
                &[],
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to record run event");
        }
    }

    async fn audit_denied(&self, ctx: &SecurityContext, action: &str, resource: &str) {
        if let Err(e) = self
            .audit
            .record(
                ctx.organization_id,
                ctx.user_id,
                action,
                resource,
                AuditOutcome::Denied,
                serde_json::json!({}),
            )
            .await
        {
            warn!(error = %e, "Failed to audit denial");
        }
    }
}

/// Seed instance variables from definition defaults and trigger input.
fn seed_variables(
    definition: &WorkflowDefinition,
    trigger_variables: Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut variables = Map::new();
    for spec in &definition.variables {
        if let Some(ref default) = spec.default {
            variables.insert(spec.name.clone(), default.clone());
        }
    }
    for (name, value) in trigger_variables {
        variables.insert(name, value);
    }
    for spec in &definition.variables {
        if spec.required && !variables.contains_key(&spec.name) {
            return Err(EngineError::Validation {
                field: spec.name.clone(),
                message: "required variable not supplied".to_string(),
            });
        }
    }
    Ok(variables)
}

/// Resolve a templated entity reference to a UUID.
fn parse_entity_ref(
    step_id: &str,
    action: &str,
    template: &str,
    variables: &Map<String, Value>,
) -> Result<Uuid> {
    let resolved = resolve_template(template, variables);
    Uuid::parse_str(&resolved).map_err(|_| EngineError::ActionFailed {
        step_id: step_id.to_string(),
        action: action.to_string(),
        details: format!("'{}' does not resolve to an entity id", template),
    })
}

/// Resolve a templated amount to a number.
fn resolve_amount(
    step_id: &str,
    action: &str,
    value: &Value,
    variables: &Map<String, Value>,
) -> Result<f64> {
    let resolved = resolve_value(value, variables);
    match &resolved {
        Value::Null => Ok(0.0),
        Value::Number(n) => n.as_f64().ok_or_else(|| EngineError::ActionFailed {
            step_id: step_id.to_string(),
            action: action.to_string(),
            details: "amount is not representable".to_string(),
        }),
        Value::String(s) => s.parse().map_err(|_| EngineError::ActionFailed {
            step_id: step_id.to_string(),
            action: action.to_string(),
            details: format!("'{}' is not a number", s),
        }),
        other => Err(EngineError::ActionFailed {
            step_id: step_id.to_string(),
            action: action.to_string(),
            details: format!("amount has unsupported type: {}", other),
        }),
    }
}

/// Wrap a store/status failure as an action failure for handler routing.
fn action_failed(step: &WorkflowStep, action: &WorkflowAction, error: EngineError) -> EngineError {
    match error {
        // Guardrail and validation kinds keep their code for routing
        e @ EngineError::GuardrailViolation { .. } => e,
        e => EngineError::ActionFailed {
            step_id: step.id.clone(),
            action: action.tag().to_string(),
            details: e.to_string(),
        },
    }
}
