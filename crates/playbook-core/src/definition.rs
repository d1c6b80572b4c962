// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definition model.
//!
//! Definitions are data, not schema: they are stored as the metadata of a
//! `workflow_definition` entity and are immutable once published. The step,
//! action, guardrail, and condition vocabularies are closed enums so the
//! compiler enforces that every kind is handled and parameters are
//! well-typed.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::template;

/// Entity type under which definitions are stored.
pub const DEFINITION_ENTITY_TYPE: &str = "workflow_definition";

/// A published workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Definition name.
    pub name: String,
    /// Definition version; a new version is a new definition entity.
    pub version: u32,
    /// How instances of this definition are triggered.
    #[serde(default)]
    pub trigger: TriggerSpec,
    /// Typed variable schema with defaults.
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    /// Ordered steps.
    pub steps: Vec<WorkflowStep>,
}

/// How instances of a definition are started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Trigger kind.
    #[serde(rename = "type", default)]
    pub trigger_type: TriggerType,
    /// Trigger-specific configuration (entity type to watch, cron line).
    #[serde(default)]
    pub config: Value,
}

/// Trigger kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Started by an explicit API call.
    #[default]
    Manual,
    /// Started when an entity of a configured type is created.
    EntityCreated,
    /// Started by an external scheduler.
    Schedule,
}

/// One declared instance variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Variable name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub var_type: VariableType,
    /// Default value seeded at start.
    #[serde(default)]
    pub default: Option<Value>,
    /// Whether the trigger must supply a value.
    #[serde(default)]
    pub required: bool,
}

/// Variable types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    /// UTF-8 text.
    String,
    /// Floating-point number.
    Number,
    /// Boolean.
    Boolean,
    /// Arbitrary JSON.
    Json,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step identifier, unique within the definition.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Step kind with kind-specific parameters.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Ordered actions executed by the step.
    #[serde(default)]
    pub actions: Vec<WorkflowAction>,
    /// Preconditions evaluated before the actions; failure fails the
    /// instance.
    #[serde(default)]
    pub guardrails: Vec<StepGuardrail>,
    /// Step timeout, driven by an external time trigger.
    #[serde(default)]
    pub timeout: Option<StepTimeout>,
    /// Error code to fallback-step-id routing; `default` catches the rest.
    #[serde(default)]
    pub error_handlers: HashMap<String, String>,
}

/// Step kinds (closed enumeration).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Execute the step's actions in order.
    Action,
    /// Create a task for a human and suspend until externally completed.
    UserAction {
        /// Assignee, resolvable from instance variables.
        #[serde(default)]
        assignee: Option<String>,
        /// Due offset for the created task.
        #[serde(default)]
        due_in_hours: Option<i64>,
    },
    /// Run the actions only when the condition holds; a no-op otherwise.
    Conditional {
        /// The condition evaluated against instance variables.
        condition: Condition,
    },
    /// Record intent and suspend until an external scheduler resumes.
    Wait {
        /// Resume after this many seconds (recorded, not slept in-process).
        #[serde(default)]
        resume_after_seconds: Option<i64>,
        /// Or resume on this named external event.
        #[serde(default)]
        event: Option<String>,
    },
    /// Fan out branch steps; all must complete before advancing.
    Parallel {
        /// Branch steps; each records its own execution row.
        branches: Vec<WorkflowStep>,
    },
    /// Run the step's actions once per element of an array variable.
    Loop {
        /// Variable holding the array to iterate.
        items: String,
        /// Variable bound to the current element inside each iteration.
        item_var: String,
    },
}

impl StepKind {
    /// Stable tag for logging and step-execution rows.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::UserAction { .. } => "user_action",
            Self::Conditional { .. } => "conditional",
            Self::Wait { .. } => "wait",
            Self::Parallel { .. } => "parallel",
            Self::Loop { .. } => "loop",
        }
    }
}

/// Step timeout declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTimeout {
    /// Timeout duration in seconds.
    pub duration_seconds: i64,
    /// Step to jump to when the timeout fires; absent means fail.
    #[serde(default)]
    pub fallback_step_id: Option<String>,
}

/// Boolean condition tree evaluated against instance variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Variable equals the literal value.
    Eq {
        /// Variable name.
        var: String,
        /// Literal to compare with.
        value: Value,
    },
    /// Variable differs from the literal value.
    Ne {
        /// Variable name.
        var: String,
        /// Literal to compare with.
        value: Value,
    },
    /// Numeric greater-than.
    Gt {
        /// Variable name.
        var: String,
        /// Literal to compare with.
        value: f64,
    },
    /// Numeric greater-or-equal.
    Gte {
        /// Variable name.
        var: String,
        /// Literal to compare with.
        value: f64,
    },
    /// Numeric less-than.
    Lt {
        /// Variable name.
        var: String,
        /// Literal to compare with.
        value: f64,
    },
    /// Numeric less-or-equal.
    Lte {
        /// Variable name.
        var: String,
        /// Literal to compare with.
        value: f64,
    },
    /// Variable is present and truthy (not null, false, 0, or "").
    Truthy {
        /// Variable name.
        var: String,
    },
    /// All sub-conditions hold.
    All {
        /// Sub-conditions.
        conditions: Vec<Condition>,
    },
    /// At least one sub-condition holds.
    Any {
        /// Sub-conditions.
        conditions: Vec<Condition>,
    },
    /// The sub-condition does not hold.
    Not {
        /// Negated condition.
        condition: Box<Condition>,
    },
}

impl Condition {
    /// Evaluate the condition against instance variables.
    ///
    /// Missing variables compare as JSON null; numeric comparisons against
    /// non-numeric values are false.
    pub fn evaluate(&self, variables: &Map<String, Value>) -> bool {
        let get = |var: &str| variables.get(var).cloned().unwrap_or(Value::Null);
        let num = |var: &str| variables.get(var).and_then(|v| v.as_f64());
        match self {
            Self::Eq { var, value } => get(var) == *value,
            Self::Ne { var, value } => get(var) != *value,
            Self::Gt { var, value } => num(var).is_some_and(|n| n > *value),
            Self::Gte { var, value } => num(var).is_some_and(|n| n >= *value),
            Self::Lt { var, value } => num(var).is_some_and(|n| n < *value),
            Self::Lte { var, value } => num(var).is_some_and(|n| n <= *value),
            Self::Truthy { var } => match get(var) {
                Value::Null => false,
                Value::Bool(b) => b,
                Value::Number(n) => n.as_f64() != Some(0.0),
                Value::String(s) => !s.is_empty(),
                Value::Array(_) | Value::Object(_) => true,
            },
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(variables)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(variables)),
            Self::Not { condition } => !condition.evaluate(variables),
        }
    }

    fn collect_vars(&self, out: &mut HashSet<String>) {
        match self {
            Self::Eq { var, .. }
            | Self::Ne { var, .. }
            | Self::Gt { var, .. }
            | Self::Gte { var, .. }
            | Self::Lt { var, .. }
            | Self::Lte { var, .. }
            | Self::Truthy { var } => {
                out.insert(var.clone());
            }
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.collect_vars(out);
                }
            }
            Self::Not { condition } => condition.collect_vars(out),
        }
    }
}

/// One line of a `create_transaction` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLine {
    /// 1-based line order.
    pub line_number: i32,
    /// Line description (templated).
    #[serde(default)]
    pub description: Option<String>,
    /// Line amount.
    #[serde(default)]
    pub amount: f64,
    /// Entity the line refers to (templated entity id).
    #[serde(default)]
    pub entity: Option<String>,
}

/// Workflow actions (closed tagged set).
///
/// Each variant names exactly one mutation against the store adapter or the
/// status transition manager. String parameters support `${var}`
/// interpolation resolved immediately before the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Create an entity.
    CreateEntity {
        /// Entity type to create.
        entity_type: String,
        /// Entity name (templated).
        name: String,
        /// Optional business code (templated).
        #[serde(default)]
        code: Option<String>,
        /// Smart code for the new entity.
        smart_code: String,
        /// Metadata for the new entity (templated recursively).
        #[serde(default)]
        metadata: Option<Value>,
        /// Variable to store the created entity's id in.
        #[serde(default)]
        output_var: Option<String>,
    },
    /// Create a relationship between two entities.
    CreateRelationship {
        /// Source entity id (templated).
        from: String,
        /// Target entity id (templated).
        to: String,
        /// Relationship type.
        relationship_type: String,
        /// Smart code for the new relationship.
        smart_code: String,
    },
    /// Transition an entity's status (delegates to the status manager).
    SetStatus {
        /// Subject entity id (templated).
        subject: String,
        /// Target status smart code.
        status_smart_code: String,
    },
    /// Create a transaction with optional lines.
    CreateTransaction {
        /// Transaction type.
        transaction_type: String,
        /// Smart code for the new transaction.
        smart_code: String,
        /// Source entity id (templated).
        #[serde(default)]
        source: Option<String>,
        /// Target entity id (templated).
        #[serde(default)]
        target: Option<String>,
        /// Total amount; a templated string is also accepted.
        #[serde(default)]
        total_amount: Value,
        /// Line items.
        #[serde(default)]
        lines: Vec<ActionLine>,
        /// Variable to store the created transaction's id in.
        #[serde(default)]
        output_var: Option<String>,
    },
    /// Send a notification (fire-and-forget, never retried).
    SendNotification {
        /// Delivery channel (email, sms, webhook).
        channel: String,
        /// Recipient (templated).
        recipient: String,
        /// Message body (templated).
        message: String,
    },
    /// Call an external API through the configured client.
    CallExternalApi {
        /// HTTP method.
        method: String,
        /// Target URL (templated).
        url: String,
        /// Request payload (templated recursively).
        #[serde(default)]
        payload: Option<Value>,
        /// Variable to store the response in.
        #[serde(default)]
        output_var: Option<String>,
    },
    /// Set or compute an instance variable.
    SetVariable {
        /// Variable name.
        name: String,
        /// Value (templated recursively).
        value: Value,
    },
}

impl WorkflowAction {
    /// Stable tag for logging and error reporting.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::CreateEntity { .. } => "create_entity",
            Self::CreateRelationship { .. } => "create_relationship",
            Self::SetStatus { .. } => "set_status",
            Self::CreateTransaction { .. } => "create_transaction",
            Self::SendNotification { .. } => "send_notification",
            Self::CallExternalApi { .. } => "call_external_api",
            Self::SetVariable { .. } => "set_variable",
        }
    }
}

fn default_payment_link_suffix() -> String {
    "_LINKED_TO_PAYMENT".to_string()
}

/// Step guardrails (closed set). Evaluated before a step's actions; failure
/// fails the step and the instance, never skips silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepGuardrail {
    /// At least one settled/approved payment transaction must be linked to
    /// the subject entity via a `*_LINKED_TO_PAYMENT` relationship.
    PaymentRequired {
        /// Subject entity id (templated).
        subject: String,
        /// Relationship type suffix identifying payment links.
        #[serde(default = "default_payment_link_suffix")]
        link_suffix: String,
    },
    /// The subject entity's current status must match.
    StatusIs {
        /// Subject entity id (templated).
        subject: String,
        /// Required status smart code.
        status_smart_code: String,
    },
    /// The named instance variable must be present and non-null.
    VariablePresent {
        /// Variable name.
        name: String,
    },
}

impl StepGuardrail {
    /// Stable tag for logging and error reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PaymentRequired { .. } => "payment_required",
            Self::StatusIs { .. } => "status_is",
            Self::VariablePresent { .. } => "variable_present",
        }
    }
}

/// One issue reported by [`WorkflowDefinition::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Step the issue belongs to, when applicable.
    pub step_id: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl WorkflowDefinition {
    /// Parse a definition from entity metadata.
    pub fn parse(metadata: &Value) -> Result<Self> {
        serde_json::from_value(metadata.clone()).map_err(|e| EngineError::Validation {
            field: "definition".to_string(),
            message: e.to_string(),
        })
    }

    /// Top-level step count, used for progress projections.
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Find a top-level step by id.
    pub fn find_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Index of a top-level step by id.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Publish-time validation.
    ///
    /// Reports duplicate step ids, dangling error-handler and timeout
    /// targets, loops over undeclared variables, and `${var}` references
    /// that no declared variable, action output, or loop binding can
    /// satisfy. An empty result means the definition is publishable.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.steps.is_empty() {
            issues.push(ValidationIssue {
                step_id: None,
                message: "definition has no steps".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut all_steps: Vec<&WorkflowStep> = Vec::new();
        collect_steps(&self.steps, &mut all_steps);
        for step in &all_steps {
            if !seen.insert(step.id.clone()) {
                issues.push(ValidationIssue {
                    step_id: Some(step.id.clone()),
                    message: format!("duplicate step id '{}'", step.id),
                });
            }
        }

        let top_level: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &all_steps {
            for (error_code, target) in &step.error_handlers {
                if !top_level.contains(target.as_str()) {
                    issues.push(ValidationIssue {
                        step_id: Some(step.id.clone()),
                        message: format!(
                            "error handler '{}' routes to unknown step '{}'",
                            error_code, target
                        ),
                    });
                }
            }
            if let Some(timeout) = &step.timeout
                && let Some(ref fallback) = timeout.fallback_step_id
                && !top_level.contains(fallback.as_str())
            {
                issues.push(ValidationIssue {
                    step_id: Some(step.id.clone()),
                    message: format!("timeout routes to unknown step '{}'", fallback),
                });
            }
        }

        let known = self.known_variable_names(&all_steps);
        for step in &all_steps {
            for name in referenced_variables(step) {
                if !known.contains(&name) {
                    issues.push(ValidationIssue {
                        step_id: Some(step.id.clone()),
                        message: format!("unresolved variable reference '${{{}}}'", name),
                    });
                }
            }
            if let StepKind::Loop { items, .. } = &step.kind
                && !known.contains(items)
            {
                issues.push(ValidationIssue {
                    step_id: Some(step.id.clone()),
                    message: format!("loop iterates over undeclared variable '{}'", items),
                });
            }
        }

        issues
    }

    /// Names a `${var}` reference can legitimately resolve against:
    /// declared variables, action outputs, and loop bindings.
    fn known_variable_names(&self, all_steps: &[&WorkflowStep]) -> HashSet<String> {
        let mut known: HashSet<String> =
            self.variables.iter().map(|v| v.name.clone()).collect();
        for step in all_steps {
            if let StepKind::Loop { item_var, .. } = &step.kind {
                known.insert(item_var.clone());
            }
            for action in &step.actions {
                match action {
                    WorkflowAction::SetVariable { name, .. } => {
                        known.insert(name.clone());
                    }
                    WorkflowAction::CreateEntity {
                        output_var: Some(name),
                        ..
                    }
                    | WorkflowAction::CreateTransaction {
                        output_var: Some(name),
                        ..
                    }
                    | WorkflowAction::CallExternalApi {
                        output_var: Some(name),
                        ..
                    } => {
                        known.insert(name.clone());
                    }
                    _ => {}
                }
            }
        }
        known
    }
}

/// Depth-first collection of steps including parallel branches.
fn collect_steps<'a>(steps: &'a [WorkflowStep], out: &mut Vec<&'a WorkflowStep>) {
    for step in steps {
        out.push(step);
        if let StepKind::Parallel { branches } = &step.kind {
            collect_steps(branches, out);
        }
    }
}

/// All `${var}` references appearing in a step's parameters, plus condition
/// variables.
fn referenced_variables(step: &WorkflowStep) -> HashSet<String> {
    let mut refs = HashSet::new();

    if let StepKind::Conditional { condition } = &step.kind {
        condition.collect_vars(&mut refs);
    }
    if let StepKind::UserAction {
        assignee: Some(assignee),
        ..
    } = &step.kind
    {
        refs.extend(template::template_refs(assignee));
    }

    // Serialize actions and guardrails and sweep every string for tokens
    for part in [
        serde_json::to_value(&step.actions).unwrap_or(Value::Null),
        serde_json::to_value(&step.guardrails).unwrap_or(Value::Null),
    ] {
        collect_string_refs(&part, &mut refs);
    }
    refs
}

fn collect_string_refs(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => out.extend(template::template_refs(s)),
        Value::Array(items) => {
            for item in items {
                collect_string_refs(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_string_refs(v, out);
            }
        }
        _ => {}
    }
}
