// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only audit trail for security-relevant actions.
//!
//! Every permission denial, cancellation, and idempotent replay is recorded
//! as an immutable `security_audit` transaction so operators can reconstruct
//! who did what, when, with what result, without relying on transient logs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{NewTransaction, Store, TransactionFilter};

/// Transaction type used for audit records.
pub const AUDIT_TRANSACTION_TYPE: &str = "security_audit";

const AUDIT_SMART_CODE: &str = "PLAYBOOK.SECURITY.AUDIT.V1";

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The action was performed.
    Success,
    /// The action was refused (permission denial, illegal transition).
    Denied,
    /// The action was attempted and failed.
    Failure,
}

impl AuditOutcome {
    /// Stable string form stored in the audit record.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Failure => "failure",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Record identifier.
    pub id: Uuid,
    /// The user who performed (or attempted) the action.
    pub actor_id: Option<Uuid>,
    /// The action name (e.g. `run.cancel`, `run.start`).
    pub action: String,
    /// The resource the action targeted.
    pub resource: String,
    /// Outcome string (`success`, `denied`, `failure`).
    pub outcome: String,
    /// Additional context captured with the record.
    pub context: serde_json::Value,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

/// Filter options for audit retrieval.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by acting user.
    pub actor_id: Option<Uuid>,
    /// Filter by action name.
    pub action: Option<String>,
    /// Filter by outcome.
    pub outcome: Option<AuditOutcome>,
    /// Filter records written at or after this time.
    pub since: Option<DateTime<Utc>>,
}

/// Appends and retrieves audit records.
pub struct AuditService {
    store: Arc<dyn Store>,
}

impl AuditService {
    /// Create a new audit service over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append one audit record. Records are never updated or deleted.
    #[instrument(skip(self, context), fields(action = %action, outcome = ?outcome))]
    pub async fn record(
        &self,
        organization_id: Uuid,
        actor_id: Uuid,
        action: &str,
        resource: &str,
        outcome: AuditOutcome,
        context: serde_json::Value,
    ) -> Result<()> {
        self.store
            .create_transaction(
                &NewTransaction {
                    organization_id,
                    transaction_type: AUDIT_TRANSACTION_TYPE.to_string(),
                    smart_code: AUDIT_SMART_CODE.to_string(),
                    source_entity_id: Some(actor_id),
                    target_entity_id: None,
                    total_amount: 0.0,
                    transaction_date: Utc::now(),
                    metadata: serde_json::json!({
                        "action": action,
                        "resource": resource,
                        "outcome": outcome.as_str(),
                        "context": context,
                    }),
                },
                &[],
            )
            .await?;
        Ok(())
    }

    /// Retrieve audit records matching the filter, oldest first.
    pub async fn query(
        &self,
        organization_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>> {
        let mut metadata_contains = serde_json::Map::new();
        if let Some(ref action) = filter.action {
            metadata_contains.insert("action".to_string(), serde_json::json!(action));
        }
        if let Some(outcome) = filter.outcome {
            metadata_contains.insert("outcome".to_string(), serde_json::json!(outcome.as_str()));
        }

        let txn_filter = TransactionFilter {
            transaction_type: Some(AUDIT_TRANSACTION_TYPE.to_string()),
            source_entity_id: filter.actor_id,
            metadata_contains: if metadata_contains.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(metadata_contains))
            },
            created_after: filter.since,
            ..Default::default()
        };

        let rows = self
            .store
            .query_transactions(organization_id, &txn_filter, limit, offset)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| AuditEvent {
                id: row.id,
                actor_id: row.source_entity_id,
                action: row
                    .metadata
                    .get("action")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                resource: row
                    .metadata
                    .get("resource")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                outcome: row
                    .metadata
                    .get("outcome")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                context: row
                    .metadata
                    .get("context")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
                recorded_at: row.created_at,
            })
            .collect())
    }
}
