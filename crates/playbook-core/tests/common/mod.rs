// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for engine end-to-end tests on the in-memory store.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use playbook_core::definition::WorkflowDefinition;
use playbook_core::engine::{RunRecord, StepExecutionRecord, WorkflowEngine};
use playbook_core::runs::RunControlService;
use playbook_core::security::SecurityContext;
use playbook_core::status::STATUS_ENTITY_TYPE;
use playbook_core::store::{
    MemoryStore, NewEntity, NewRelationship, NewTransaction, Store, TransactionFilter,
};

/// One wired test environment over a fresh in-memory store.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub org: Uuid,
    pub engine: Arc<WorkflowEngine>,
    pub control: RunControlService,
}

impl TestContext {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn Store> = store.clone();
        let engine = Arc::new(WorkflowEngine::new(store_dyn.clone()));
        let control = RunControlService::new(store_dyn, engine.clone());
        Self {
            store,
            org: Uuid::new_v4(),
            engine,
            control,
        }
    }

    /// Build a security context without going through entity resolution.
    pub fn ctx(&self, permissions: &[&str]) -> SecurityContext {
        SecurityContext {
            user_id: Uuid::new_v4(),
            organization_id: self.org,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            roles: HashSet::new(),
        }
    }

    /// A context that can publish and execute.
    pub fn operator(&self) -> SecurityContext {
        self.ctx(&[
            "playbook_definition:publish",
            "playbook_run:execute",
            "playbook_run:read",
        ])
    }

    pub async fn publish(&self, definition: Value) -> Uuid {
        let definition = WorkflowDefinition::parse(&definition).unwrap();
        self.engine
            .publish_definition(self.org, &definition, &self.operator())
            .await
            .unwrap()
    }

    pub async fn start(
        &self,
        definition_id: Uuid,
        variables: Value,
        ctx: &SecurityContext,
    ) -> RunRecord {
        let variables: Map<String, Value> = variables.as_object().cloned().unwrap_or_default();
        self.engine
            .start(self.org, definition_id, variables, ctx)
            .await
            .unwrap()
    }

    /// All step execution rows for a run, ordered by sequence.
    pub async fn step_rows(&self, run_id: Uuid) -> Vec<StepExecutionRecord> {
        let rows = self
            .store
            .query_transactions(
                self.org,
                &TransactionFilter {
                    transaction_type: Some("WORKFLOW_STEP_EXECUTION".to_string()),
                    metadata_contains: Some(json!({ "instance_id": run_id })),
                    ..Default::default()
                },
                1000,
                0,
            )
            .await
            .unwrap();
        let mut records: Vec<StepExecutionRecord> = rows
            .iter()
            .map(|row| StepExecutionRecord::from_transaction(row).unwrap())
            .collect();
        records.sort_by_key(|r| (r.sequence, r.started_at));
        records
    }

    pub async fn seed_status_entity(&self, name: &str, smart_code: &str) -> Uuid {
        self.store
            .create_entity(&NewEntity {
                organization_id: self.org,
                entity_type: STATUS_ENTITY_TYPE.to_string(),
                name: name.to_string(),
                code: None,
                smart_code: smart_code.to_string(),
                metadata: json!({}),
            })
            .await
            .unwrap()
            .id
    }

    pub async fn seed_entity(&self, entity_type: &str, name: &str) -> Uuid {
        self.store
            .create_entity(&NewEntity {
                organization_id: self.org,
                entity_type: entity_type.to_string(),
                name: name.to_string(),
                code: None,
                smart_code: format!("PLAYBOOK.TEST.{}.V1", entity_type.to_uppercase()),
                metadata: json!({}),
            })
            .await
            .unwrap()
            .id
    }

    /// Link a payment transaction with the given status to a subject entity.
    pub async fn seed_payment(&self, subject: Uuid, payment_status: &str) {
        let payment = self
            .store
            .create_transaction(
                &NewTransaction {
                    organization_id: self.org,
                    transaction_type: "payment".to_string(),
                    smart_code: "PLAYBOOK.SALES.PAYMENT.V1".to_string(),
                    source_entity_id: Some(subject),
                    target_entity_id: None,
                    total_amount: 100.0,
                    transaction_date: Utc::now(),
                    metadata: json!({ "status": payment_status }),
                },
                &[],
            )
            .await
            .unwrap();
        self.store
            .create_relationship(&NewRelationship {
                organization_id: self.org,
                from_entity_id: subject,
                to_entity_id: payment.id,
                relationship_type: "ORDER_LINKED_TO_PAYMENT".to_string(),
                smart_code: "PLAYBOOK.SALES.PAYMENT.LINK.V1".to_string(),
                is_active: true,
                effective_date: Utc::now(),
            })
            .await
            .unwrap();
    }
}

/// A two-step definition: create an entity, then create a transaction
/// linked to it.
pub fn two_step_definition() -> Value {
    json!({
        "name": "order-intake",
        "version": 1,
        "variables": [
            {"name": "customer_name", "type": "string", "required": true},
            {"name": "amount", "type": "number", "default": 50},
        ],
        "steps": [
            {
                "id": "create_order",
                "name": "Create order",
                "type": "action",
                "actions": [
                    {
                        "action": "create_entity",
                        "entity_type": "order",
                        "name": "Order for ${customer_name}",
                        "smart_code": "PLAYBOOK.SALES.ORDER.V1",
                        "output_var": "order_id",
                    }
                ],
            },
            {
                "id": "record_charge",
                "name": "Record charge",
                "type": "action",
                "actions": [
                    {
                        "action": "create_transaction",
                        "transaction_type": "charge",
                        "smart_code": "PLAYBOOK.SALES.CHARGE.V1",
                        "source": "${order_id}",
                        "total_amount": "${amount}",
                    }
                ],
            },
        ],
    })
}
